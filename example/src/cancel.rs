use std::time::Duration;

use pgpoll::{AsyncConnection, Result, Status};

/// Cancellation races with completion, both outcomes leave the connection idle.
pub async fn main() -> Result<()> {
    let mut conn = AsyncConnection::connect_env().await?;
    let token = conn.get_ref().cancellation()?;

    conn.get_mut().send_query("SELECT pg_sleep(5)")?;
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::spawn_blocking(move || token.do_cancel(Duration::from_secs(5))).await
    });

    while let Some(result) = conn.next_result().await? {
        match result.error() {
            Some(err) => assert_eq!(err.code(), "57014"),
            None => tracing::info!("completed before cancel"),
        }
    }
    canceller.await.unwrap().unwrap()?;
    assert_eq!(conn.get_ref().status(), Status::Idle);

    Ok(())
}
