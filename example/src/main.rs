use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use pgpoll::Result;

mod blocking;
mod polling;
mod decode;
mod notify;
mod cancel;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    trace_span!("blocking").in_scope(blocking::main)?;
    trace_span!("polling").in_scope(polling::main)?;
    trace_span!("decode").in_scope(decode::main)?;

    notify::main().instrument(trace_span!("notify")).await?;
    cancel::main().instrument(trace_span!("cancel")).await?;

    Ok(())
}
