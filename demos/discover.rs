//! Browses the local network for instances of a service type.

use std::time::Duration;

use castlight::query::{query, QueryParams};
use log::LevelFilter;

fn main() -> Result<(), castlight::Error> {
    env_logger::Builder::new()
        .filter_module("castlight", LevelFilter::Trace)
        .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Trace)
        .init();

    let service = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "_http._tcp".to_string());

    let mut count = 0;
    for entry in query(QueryParams::new(&service).timeout(Duration::from_secs(3)))? {
        println!("{}", entry);
        count += 1;
    }
    println!();
    println!("discovered {} instances of {}", count, service);

    Ok(())
}
