//! ---
//! wb_section: "03-observability"
//! wb_subsection: "module"
//! wb_type: "source"
//! wb_scope: "code"
//! wb_description: "Structured logging context and lifecycle events."
//! wb_version: "v0.1.0"
//! wb_owner: "tbd"
//! ---
//! Context-enriched logging macros.

#[doc(hidden)]
#[macro_export]
macro_rules! __wb_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx: &$crate::LogContext = &$ctx;
        tracing::event!(
            $level,
            cluster = ctx.cluster.unwrap_or(""),
            remote_address = ctx.remote_address.unwrap_or(""),
            session_id = ctx.session_id.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with proxy context.
#[macro_export]
macro_rules! wb_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__wb_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__wb_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with proxy context.
#[macro_export]
macro_rules! wb_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__wb_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__wb_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with proxy context.
#[macro_export]
macro_rules! wb_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__wb_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__wb_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
