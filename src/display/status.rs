//! Single-line status display.
//! Redraws one terminal line per report; the delivery thread never waits on it.

use std::io::Write;

use flume::Receiver;
use tracing::debug;

use crate::pipeline::StatusReport;

const HINT: &str = " (press any key to stop)     ";

/// Text for one report, without the leading carriage return
pub fn render(report: &StatusReport) -> String {
    match report {
        StatusReport::Averages {
            averages,
            elapsed,
            failed_stages,
        } => {
            let [a, b, c] = averages.order.labels();
            let mut line = format!(
                "Channel averages ({a}, {b}, {c}): {averages} took {:.3} ms",
                elapsed.as_secs_f64() * 1000.0
            );
            if *failed_stages > 0 {
                line.push_str(&format!(" [{failed_stages} stage(s) failed]"));
            }
            line + HINT
        }
        StatusReport::Unsupported { tag } => {
            format!("Frametype {tag} is not supported!{HINT}")
        }
        StatusReport::Skipped { reason } => format!("Frame skipped: {reason}{HINT}"),
    }
}

/// Draw reports until every sender is gone
pub async fn run<W: Write>(rx: Receiver<StatusReport>, mut out: W) {
    while let Ok(report) = rx.recv_async().await {
        let line = render(&report);
        if let Err(e) = write!(out, "\r{line}").and_then(|()| out.flush()) {
            debug!("status line write failed: {}", e);
        }
    }
    let _ = writeln!(out, "\r");
}
