/// Builds a handler closure for the `HandlerTable::on_*` methods.
///
/// Takes an optional setup block, run on every invocation before the handler
/// future is created (clone `Arc`s there), the name to bind the
/// [`JobRun`](crate::handler::JobRun) to, and the async body, which must
/// evaluate to `Result<(), HandlerError>`.
///
/// # Usage
///
/// ```ignore
/// # use jobkeeper::{handler_fn, HandlerTable, HandlerError};
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// let sent = Arc::new(AtomicUsize::new(0));
///
/// let handlers = HandlerTable::logging().on_welcome_email(handler_fn! {
///     { let sent = sent.clone(); }
///     |run| {
///         tracing::info!(email = %run.payload.email, "sending");
///         sent.fetch_add(1, Ordering::SeqCst);
///         Ok::<(), HandlerError>(())
///     }
/// });
/// ```
#[macro_export]
macro_rules! handler_fn {
    // Setup block followed by the handler body.
    (
        { $($setup:stmt);* $(;)? }
        |$run:ident| $body:block
    ) => {
        move |$run| {
            $($setup;)*
            async move $body
        }
    };

    // Handler body only.
    (
        |$run:ident| $body:block
    ) => {
        move |$run| async move $body
    };
}
