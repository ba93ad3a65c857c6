//! Battery-powered temperature/humidity node.
//!
//! The `esp32` feature builds the real firmware; without it the same lifecycle
//! runs on the host against a real MQTT broker with simulated hardware.

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
