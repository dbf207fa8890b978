use chrono::{DateTime, Utc};

use crate::types::TriggerKind;

/// Deferred re-evaluations requested by the engine.
///
/// Implementations keep at most one pending trigger per [`TriggerKind`]:
/// `schedule` replaces whatever was pending for that kind, and `cancel` is a
/// no-op when nothing is pending or the trigger already fired.
pub trait TriggerSink {
    fn schedule(&mut self, kind: TriggerKind, at: DateTime<Utc>);
    fn cancel(&mut self, kind: TriggerKind);

    fn cancel_all(&mut self) {
        for kind in [TriggerKind::Heating, TriggerKind::Preheat, TriggerKind::Event] {
            self.cancel(kind);
        }
    }
}
