//! Build script for the epdclock firmware.
//!
//! - Reads Wi-Fi credentials from `.env` (or the environment) into
//!   `WIFI_SSID` / `WIFI_PASS` for `env!`
//! - Adds the esp-hal linker script

fn main() {
    // A missing .env is fine when the variables come from the environment.
    let _ = dotenvy::dotenv();
    println!("cargo:rerun-if-changed=.env");

    for key in ["WIFI_SSID", "WIFI_PASS"] {
        println!("cargo:rerun-if-env-changed={key}");
        match std::env::var(key) {
            Ok(value) => println!("cargo:rustc-env={key}={value}"),
            Err(_) => println!("cargo:warning={key} is not set; Wi-Fi will not connect"),
        }
    }

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
