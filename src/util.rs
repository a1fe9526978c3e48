use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a sentry performance transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "queue.task");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Turn a panic payload into an error message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;

    #[tokio::test]
    async fn panic_messages_are_preserved() {
        let payload = AssertUnwindSafe(async { panic!("boom {}", 42); })
            .catch_unwind()
            .await
            .unwrap_err();
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked: boom 42");

        let payload = AssertUnwindSafe(async { std::panic::panic_any(7_u8); })
            .catch_unwind()
            .await
            .unwrap_err();
        assert_eq!(try_to_extract_panic_info(&*payload).to_string(), "job panicked");
    }

    #[tokio::test]
    async fn transaction_passes_the_result_through() {
        let ok: Result<u8, ()> = with_sentry_transaction("test", || async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));
        let err: Result<(), &str> = with_sentry_transaction("test", || async { Err("nope") }).await;
        assert_eq!(err, Err("nope"));
    }
}
