mod animation;
#[cfg(feature = "ble")]
mod ble;
mod bridge;
mod host;
mod peripheral;
mod session;
mod shutoff;
#[cfg(any(test, not(feature = "ble")))]
mod simulated;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
