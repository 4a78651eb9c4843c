//! `iris basic`: count messages through a standalone receiver.

use super::{rate, wait_for, SchedulerArgs};
use crate::output::StyledOutput;
use iris_core::{Arbiter, Message, Port, SchedulerStats};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Serialize)]
struct BasicReport {
    messages: u64,
    delivered: u64,
    failed: u64,
    sum: i64,
    elapsed_ms: f64,
    messages_per_sec: f64,
    scheduler: SchedulerStats,
}

pub fn execute(
    messages: u64,
    args: &SchedulerArgs,
    json: bool,
    out: &mut StyledOutput,
) -> anyhow::Result<()> {
    let scheduler = args.build()?;
    let port: Port = Port::new();
    let sum = Arc::new(AtomicI64::new(0));

    let total = Arc::clone(&sum);
    let receiver = Arbiter::with_scheduler(scheduler.clone())
        .receive(&port, move |msg: Message| {
            let n = msg.data().and_then(|v| v.as_int()).ok_or("message without payload")?;
            total.fetch_add(n, Ordering::Relaxed);
            Ok(())
        })
        .standalone()?;

    info!(messages, policy = %args.policy, "posting messages");
    let start = Instant::now();
    for i in 0..messages {
        port.post(Message::with_data(1, i as i64));
    }
    wait_for("messages to be delivered", || receiver.delivered_count() >= messages)?;
    let elapsed = start.elapsed();

    receiver.close();
    scheduler.shutdown();

    let report = BasicReport {
        messages,
        delivered: receiver.delivered_count(),
        failed: receiver.failed_count(),
        sum: sum.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        messages_per_sec: rate(messages, elapsed),
        scheduler: scheduler.stats(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    out.success("Delivered ");
    out.plain(&format!(
        "{} messages in {:.2}ms ({:.0} msg/s)",
        report.delivered, report.elapsed_ms, report.messages_per_sec
    ));
    out.newline();
    out.field("Failed", report.failed);
    out.field("Sum", report.sum);
    out.newline();
    out.heading("Scheduler");
    out.plain(&report.scheduler.to_string());
    out.newline();
    out.flush();
    Ok(())
}
