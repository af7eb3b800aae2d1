//! Classifies a capture in port mode and prints one line per packet.
//!
//! Usage: cargo run --example classify_pcap -- trace.pcap

use capture_prep::{Config, Decision, Engine, Mode, Side};

fn main() {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: classify_pcap <trace.pcap>");
        std::process::exit(1);
    };

    let mut engine = match Engine::new(Config::new(Mode::Port)) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    match engine.run_file(std::path::Path::new(&path)) {
        Ok(cache) => {
            for (i, decision) in cache.decisions().iter().enumerate() {
                let label = match decision {
                    Decision::Skip => "drop",
                    Decision::Send(Side::Primary) => "primary",
                    Decision::Send(Side::Secondary) => "secondary",
                };
                println!("{} {label}", i + 1);
            }
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
