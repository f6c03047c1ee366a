//! Development harness: run the engine against the host's default audio
//! devices and print levels once per second.
//!
//! Usage: `auricle-loopback [--seconds N] [--unmute]`

use std::sync::Arc;
use std::time::Duration;

use auricle_core::{AudioEngine, HostCodec, NullHelperSuite};
use log::error;

fn main() {
    env_logger::init();

    let mut seconds = 10u64;
    let mut unmute = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seconds" => {
                seconds = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("--seconds expects a number");
                        std::process::exit(2);
                    });
            }
            "--unmute" => unmute = true,
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: auricle-loopback [--seconds N] [--unmute]");
                std::process::exit(2);
            }
        }
    }

    let codec = match HostCodec::new() {
        Ok(codec) => codec,
        Err(e) => {
            error!("failed to open host audio devices: {e}");
            std::process::exit(1);
        }
    };

    let mut engine = AudioEngine::new(Box::new(codec), Arc::new(NullHelperSuite));
    if unmute {
        engine.set_mute(false);
    }
    if let Err(e) = engine.start() {
        error!("failed to start engine: {e}");
        std::process::exit(1);
    }

    for _ in 0..seconds {
        std::thread::sleep(Duration::from_secs(1));
        if !engine.is_running() {
            error!("engine stopped unexpectedly");
            break;
        }
        let levels = engine.levels();
        println!(
            "rms L/R {:.4}/{:.4}  peak L/R {:.4}/{:.4}  hp rms {:.4}",
            levels.rms_left, levels.rms_right, levels.peak_left, levels.peak_right, levels.rms_hp
        );
    }

    engine.stop();
}
