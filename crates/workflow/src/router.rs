//! Label event routing.

use tracing::debug;

use crate::event::{LabelAction, LabelEvent};
use crate::trigger::{HandlerKind, LabelTrigger};

/// Selects the trigger for an event: first match in declaration order.
#[derive(Debug, Clone)]
pub struct LabelEventRouter {
    triggers: Vec<LabelTrigger>,
}

impl LabelEventRouter {
    pub fn new(triggers: Vec<LabelTrigger>) -> Self {
        Self { triggers }
    }

    pub fn triggers(&self) -> &[LabelTrigger] {
        &self.triggers
    }

    /// Trigger for `event`, or `None` when nothing applies. Removed labels
    /// never dispatch.
    pub fn route(&self, event: &LabelEvent) -> Option<&LabelTrigger> {
        if event.action == LabelAction::Removed {
            return None;
        }
        let trigger = self.match_label(&event.label);
        debug!(
            label = %event.label,
            issue = %event.issue,
            trigger = trigger.map(|t| t.name.as_str()),
            "Routed label event"
        );
        trigger
    }

    pub fn match_label(&self, label: &str) -> Option<&LabelTrigger> {
        self.triggers.iter().find(|t| t.matches(label))
    }

    /// First trigger dispatching to `kind`.
    pub fn first_for(&self, kind: HandlerKind) -> Option<&LabelTrigger> {
        self.triggers.iter().find(|t| t.handler == kind)
    }

    /// Exact labels worth listing issues by.
    pub fn discovery_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for label in self.triggers.iter().filter_map(LabelTrigger::exact_label) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }

    pub fn has_globs(&self) -> bool {
        self.triggers.iter().any(|t| t.pattern.is_glob())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::LabelPattern;
    use scm::{Backend, IssueId, RepoRef};

    fn trigger(name: &str, pattern: &str, handler: HandlerKind) -> LabelTrigger {
        LabelTrigger {
            name: name.to_string(),
            pattern: LabelPattern::compile(pattern).unwrap(),
            handler,
            ai_enabled: true,
            remove_on_complete: true,
            success_label: None,
        }
    }

    fn router() -> LabelEventRouter {
        LabelEventRouter::new(vec![
            trigger("needs-planning", "needs-planning", HandlerKind::Proposal),
            trigger("approved", "approved", HandlerKind::Approval),
            trigger("execute", "exec*", HandlerKind::TaskExecution),
            trigger("catch-all", "e*", HandlerKind::Proposal),
        ])
    }

    fn added(label: &str) -> LabelEvent {
        LabelEvent::added(
            Backend::GitHub,
            RepoRef::new("acme", "widgets"),
            IssueId::new("42"),
            label,
        )
    }

    #[test]
    fn test_first_match_wins() {
        let r = router();
        assert_eq!(r.route(&added("execute")).unwrap().name, "execute");
        assert_eq!(r.route(&added("enhancement")).unwrap().name, "catch-all");
    }

    #[test]
    fn test_no_match() {
        assert!(router().route(&added("bug")).is_none());
    }

    #[test]
    fn test_removed_events_do_not_route() {
        let mut event = added("approved");
        event.action = LabelAction::Removed;
        assert!(router().route(&event).is_none());
    }

    #[test]
    fn test_discovery_labels() {
        let r = router();
        assert_eq!(r.discovery_labels(), vec!["needs-planning", "approved"]);
        assert!(r.has_globs());
        assert_eq!(
            r.first_for(HandlerKind::Approval).unwrap().name,
            "approved"
        );
    }
}
