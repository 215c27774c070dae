//! Authenticates against a Brick Daemon with authentication enabled, then
//! triggers an enumeration.
//!
//! Authentication has to be redone after every reconnect, so it lives in the
//! connect callback rather than after `connect()`.

use brickline_client::{ConnectReason, IpConnection};

const ADDR: &str = "localhost:4223";
const SECRET: &str = "My Authentication Secret!";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ipcon = IpConnection::new();

    let auth_ipcon = ipcon.clone();
    ipcon
        .register_connect_callback(move |reason| {
            match reason {
                ConnectReason::Request => println!("Connected after request."),
                ConnectReason::AutoReconnect => println!("Auto-reconnected."),
            }
            let ipcon = auth_ipcon.clone();
            tokio::spawn(async move {
                match ipcon.authenticate(SECRET).await {
                    Ok(()) => {
                        println!("Authentication succeeded.");
                        ipcon.enumerate().await;
                    }
                    Err(err) => println!("Could not authenticate: {err}"),
                }
            });
        })
        .await;

    ipcon
        .register_enumerate_callback(|device| {
            println!("UID: {}, device identifier: {}", device.uid, device.device_identifier);
        })
        .await;

    ipcon.connect(ADDR).await?;

    println!("Press enter to exit.");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    ipcon.disconnect().await;
    ipcon.close().await;
    Ok(())
}
