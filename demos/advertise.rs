//! Advertises a demo service instance on the local network.

use std::{thread, time::Duration};

use castlight::{
    responder::{Responder, ResponderConfig},
    zone::ServiceBuilder,
};
use log::LevelFilter;

fn main() -> Result<(), castlight::Error> {
    env_logger::Builder::new()
        .filter_module("castlight", LevelFilter::Trace)
        .filter_module(env!("CARGO_CRATE_NAME"), LevelFilter::Trace)
        .init();

    let service = ServiceBuilder::new("Demo Web Server", "_http._tcp", 8080)
        .txt_entry("path=/")
        .build()?;
    println!("advertising {}", service);

    let mut responder = Responder::new(service, ResponderConfig::default());
    responder.start()?;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
