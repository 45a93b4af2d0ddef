use std::time::Duration;

use pgpoll::{Config, Connection, Fetch, PollStatus, Result, ResultStatus, Transport};

/// Drive the state machine by hand, waiting on the socket between steps.
pub fn main() -> Result<()> {
    let mut conn: Connection = Connection::with_config(Config::from_env());

    loop {
        match conn.poll()? {
            PollStatus::Ready => break,
            PollStatus::Failed => panic!("{}", conn.error_message()),
            status => {
                let interest = status.interest().unwrap();
                conn.socket_duplicate()?.wait(interest, Some(Duration::from_secs(5)))?;
            },
        }
    }
    tracing::info!(server_version = conn.server_version(), pid = conn.backend_pid());

    conn.set_notice_processor(|notice| tracing::warn!("{notice}"));
    conn.set_nonblocking(true)?;
    conn.send_query("SELECT generate_series(1, 4); DO $$ BEGIN RAISE NOTICE 'done'; END $$")?;
    assert!(conn.set_single_row_mode());

    let mut rows = 0;
    loop {
        match conn.get_result()? {
            Fetch::Ready(result) => match result.status() {
                ResultStatus::SingleTuple => rows += 1,
                status => tracing::info!(%status, tag = result.cmd_status()),
            },
            Fetch::WouldBlock => {
                let readable = conn.readiness()?.readable;
                if !readable {
                    std::thread::sleep(Duration::from_millis(1));
                }
            },
            Fetch::Exhausted => break,
        }
    }
    assert_eq!(rows, 4);

    Ok(())
}
