//! Pipelined demo app - a game loop feeding a render thread
//!
//! The main thread simulates and ticks the "Default" group; a render thread
//! in its own "render" group runs one stage behind. Both stream frames to a
//! viewer, so start one first:
//!
//!   cargo run -- --port 5185
//!   cargo run --example demo-pipeline

use framescope::{pipeline, Client, ClientConfig, CollectorOptions};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let client = Arc::new(Client::new(ClientConfig::from_env().with_program("demo-pipeline")));
    if !client.connect_default() {
        println!("⚠ No viewer reachable, recording offline");
    }

    let simulate = client.collector("frame:simulate").unwrap();
    let physics = client.collector("frame:simulate:physics").unwrap();
    let entities = client.collector_with("entities", CollectorOptions::level()).unwrap();

    let (frames_tx, frames_rx) = mpsc::sync_channel::<u32>(2);
    let render = {
        let client = Arc::clone(&client);
        thread::spawn(move || {
            pipeline::bind_current("render", "render");
            pipeline::set_current_min_stage(1);
            let draw = client.collector("frame:draw").unwrap();
            for frame in frames_rx {
                let scope = client.scope(draw).unwrap();
                thread::sleep(Duration::from_millis(u64::from(4 + frame % 3)));
                drop(scope);
                client.tick_sync_group("render");
            }
        })
    };

    for frame in 0..300_u32 {
        {
            let _simulate = client.scope(simulate).unwrap();
            client.start(physics).unwrap();
            thread::sleep(Duration::from_millis(3));
            client.stop(physics).unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        client.set_level(entities, f64::from(100 + frame % 50)).unwrap();

        if frames_tx.send(frame).is_err() {
            break;
        }
        client.tick_current().unwrap();

        if frame == 150 {
            println!("⏸ Pausing for one second");
            client.pause();
            thread::sleep(Duration::from_secs(1));
            client.resume_after_pause();
        }
    }

    drop(frames_tx);
    render.join().unwrap();

    let stats = client.stats();
    println!(
        "✓ Done: {} frames queued, {} dropped",
        stats.frames_queued, stats.frames_dropped
    );
    client.disconnect();
}
