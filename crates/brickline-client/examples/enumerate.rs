//! Connects to a Brick Daemon and lists every device in the stack.

use brickline_client::IpConnection;

const ADDR: &str = "localhost:4223";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ipcon = IpConnection::new();
    ipcon.connect(ADDR).await?;

    ipcon
        .register_enumerate_callback(|device| {
            println!("UID:               {}", device.uid);
            println!("Enumeration type:  {:?}", device.enumeration_type);
            println!("Connected UID:     {}", device.connected_uid);
            println!("Position:          {}", device.position);
            println!(
                "Hardware version:  {}.{}.{}",
                device.hardware_version[0], device.hardware_version[1], device.hardware_version[2]
            );
            println!(
                "Firmware version:  {}.{}.{}",
                device.firmware_version[0], device.firmware_version[1], device.firmware_version[2]
            );
            println!("Device identifier: {}", device.device_identifier);
            println!();
        })
        .await;

    ipcon.enumerate().await;

    println!("Press enter to exit.");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    ipcon.disconnect().await;
    ipcon.close().await;
    Ok(())
}
