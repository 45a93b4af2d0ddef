use futures::StreamExt;
use pgpoll::{AsyncConnection, Result};

pub async fn main() -> Result<()> {
    let mut listener = AsyncConnection::connect_env().await?;
    let mut sender = AsyncConnection::connect_env().await?;

    listener.query("LISTEN jobs").await?;
    sender.query("NOTIFY jobs, 'hello'").await?;

    let notify = listener.notifications().next().await.expect("connection closed")?;
    assert_eq!(notify.channel(), "jobs");
    assert_eq!(notify.payload(), "hello");
    assert_eq!(notify.process_id(), sender.get_ref().backend_pid());

    Ok(())
}
