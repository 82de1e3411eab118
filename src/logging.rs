//! Helper macros keeping replay log fields uniform.
//!
//! Every event carries `event` plus, where it applies, the `record` it concerns, so the key=value
//! and JSON outputs can be filtered the same way.

/// Log a replay event with an optional record field plus any extra fields.
#[macro_export]
macro_rules! replay_event {
    ($level:ident, $event:expr, record = $record:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: "syntised::replay",
            event = $event,
            record = $record,
            $($field = %$value,)*
        )
    };
    ($level:ident, $event:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: "syntised::replay",
            event = $event,
            $($field = %$value,)*
        )
    };
}
