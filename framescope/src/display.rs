// Time conversions intentionally lose precision for display purposes
#![allow(clippy::cast_precision_loss)]

use framescope_common::{DataFrame, Hello};
use std::io::Read;
use std::io::Write;

use crate::domain::Duration;
use crate::viewer::ViewerSession;

/// Display a newly accepted client
pub fn display_client_connected(peer: &str, hello: &Hello) {
    println!(
        "[CONNECT] {peer} program={} machine={} pid={} protocol={}.{}",
        hello.program, hello.machine, hello.pid, hello.major, hello.minor
    );
}

/// One line per frame: thread, stage, frame length, then each collector's time.
pub fn format_data_frame<S: Read + Write>(session: &ViewerSession<S>, frame: &DataFrame) -> String {
    let thread = session.thread(frame.thread).map_or("?", |t| t.name.as_str());
    let span = Duration(frame.end_ns.saturating_sub(frame.start_ns));

    let mut line = format!(
        "[FRAME] thread={thread} stage={} #{} {span}",
        frame.stage, frame.frame_number
    );
    for time in &frame.times {
        let name = session.collector_name(time.collector).unwrap_or("?");
        line.push_str(&format!(" {name}={}", Duration(time.elapsed_ns)));
    }
    for level in &frame.levels {
        let name = session.collector_name(level.collector).unwrap_or("?");
        line.push_str(&format!(" {name}={:.2}", level.value));
    }
    line
}

/// Display a data frame in headless mode
pub fn display_data_frame<S: Read + Write>(session: &ViewerSession<S>, frame: &DataFrame) {
    println!("{}", format_data_frame(session, frame));
}

/// Display a client disconnect with its frame count
pub fn display_client_closed(peer: &str, frames: u64) {
    println!("[CLOSE] {peer} frames={frames}");
    std::io::stdout().flush().ok();
}
