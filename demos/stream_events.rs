//! Event stream example.
//!
//! This program reads `UA_CREDS` (`<app key>:<master secret>`) and optionally
//! `UA_EVENTS_URL`, fetches events from the latest position, and prints each
//! event's offset, type, and channel until interrupted.
//!
//! Behavior notes:
//! - Pass a numeric offset as the first argument to resume after it instead.
//! - The stream ending on its own is reported; an interrupted run closes it.

use std::error::Error;

use airship_events::events::{fetch_from_latest, fetch_from_offset, Filter, Response};
use airship_events::Client;

fn describe(response: &Response) {
    match response.err() {
        Some(err) if err.is_end_of_stream() => println!("stream ended"),
        Some(err) => eprintln!("stream failed: {err}"),
        None => println!("stream closed"),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let resume_offset = std::env::args()
        .nth(1)
        .map(|raw| raw.parse::<u64>())
        .transpose()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::from_env()?;
        let filters: Vec<Filter> = Vec::new();
        let response = match resume_offset {
            Some(offset) => fetch_from_offset(&client, offset, filters).await?,
            None => fetch_from_latest(&client, filters).await?,
        };
        println!("operation id: {}", response.id().unwrap_or("<none>"));

        loop {
            tokio::select! {
                event = response.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let channel = event
                        .device
                        .as_ref()
                        .and_then(|device| {
                            device
                                .ios
                                .as_deref()
                                .or(device.android.as_deref())
                                .or(device.amazon.as_deref())
                        })
                        .unwrap_or("-");
                    println!("{} {} {}", event.offset, event.kind, channel);
                }
                _ = tokio::signal::ctrl_c() => {
                    response.close().await;
                    break;
                }
            }
        }

        describe(&response);
        Ok::<(), Box<dyn Error>>(())
    })
}
