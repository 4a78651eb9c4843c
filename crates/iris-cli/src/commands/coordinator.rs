//! `iris coordinator`: exclusive, concurrent and teardown receivers under one coordinator.
//!
//! The exclusive handler mutates a shared record that concurrent handlers
//! only read; the run reports any overlap it observed, which should be none.

use super::{rate, wait_for, SchedulerArgs};
use crate::output::StyledOutput;
use iris_core::{Arbiter, CoordinatorStats, Fairness, Message, Port, Receiver, SchedulerStats};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct CoordinatorOptions {
    pub iterations: u64,
    pub exclusive_every: u64,
    pub drain: bool,
}

/// Shared record guarded only by the coordinator
#[derive(Default)]
struct Record {
    writers: AtomicU64,
    readers: AtomicU64,
    version: AtomicU64,
    overlap: AtomicBool,
}

#[derive(Serialize)]
struct ClassReport {
    delivered: u64,
    failed: u64,
    queued: usize,
}

impl ClassReport {
    fn of(receiver: &Receiver) -> Self {
        Self {
            delivered: receiver.delivered_count(),
            failed: receiver.failed_count(),
            queued: receiver.get_queue_count(),
        }
    }
}

#[derive(Serialize)]
struct CoordinatorReport {
    iterations: u64,
    exclusive: ClassReport,
    concurrent: ClassReport,
    teardown: ClassReport,
    overlap_detected: bool,
    final_version: u64,
    elapsed_ms: f64,
    messages_per_sec: f64,
    coordinator: CoordinatorStats,
    scheduler: SchedulerStats,
}

pub fn execute(
    options: CoordinatorOptions,
    args: &SchedulerArgs,
    json: bool,
    out: &mut StyledOutput,
) -> anyhow::Result<()> {
    if options.exclusive_every == 0 {
        anyhow::bail!("--exclusive-every must be at least 1");
    }

    let scheduler = args.build()?;
    let arbiter = Arbiter::with_scheduler(scheduler.clone());
    let record = Arc::new(Record::default());

    let exclusive_port: Port = Port::new();
    let concurrent_port: Port = Port::new();
    let teardown_port: Port = Port::new();

    let shared = Arc::clone(&record);
    let exclusive = arbiter
        .receive(&exclusive_port, move |msg: Message| {
            if shared.writers.fetch_add(1, Ordering::SeqCst) != 0
                || shared.readers.load(Ordering::SeqCst) != 0
            {
                shared.overlap.store(true, Ordering::SeqCst);
            }
            let step = msg.get_int("count").unwrap_or(1).max(0) as u64;
            shared.version.fetch_add(step, Ordering::SeqCst);
            shared.writers.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .exclusive()
        .build()?;

    let shared = Arc::clone(&record);
    let concurrent = arbiter
        .receive(&concurrent_port, move |_: Message| {
            shared.readers.fetch_add(1, Ordering::SeqCst);
            if shared.writers.load(Ordering::SeqCst) != 0 {
                shared.overlap.store(true, Ordering::SeqCst);
            }
            shared.readers.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .concurrent()
        .build()?;

    let teardown = arbiter
        .receive(&teardown_port, |_: Message| {
            debug!("teardown handler running");
            Ok(())
        })
        .teardown()
        .build()?;

    let fairness = if options.drain {
        Fairness::Drain
    } else {
        Fairness::Throughput
    };
    let coordinator = arbiter
        .coordinate()
        .add(&exclusive)
        .add(&concurrent)
        .add(&teardown)
        .fairness(fairness)
        .build()?;

    info!(iterations = options.iterations, ?fairness, "posting messages");
    let start = Instant::now();
    for i in 0..options.iterations {
        if i % options.exclusive_every == 0 {
            exclusive_port.post(Message::new(1).with("count", 10));
        } else {
            concurrent_port.post(Message::new(2).with("index", i as i64));
        }
    }
    teardown_port.post(Message::new(3));

    wait_for("teardown", || teardown.delivered_count() == 1)?;
    let elapsed = start.elapsed();

    // Accepted but never dispatched once torn down
    exclusive_port.post(Message::new(1).with("count", 10));
    concurrent_port.post(Message::new(2));
    thread::sleep(Duration::from_millis(10));

    let handled = exclusive.delivered_count() + concurrent.delivered_count();
    let report = CoordinatorReport {
        iterations: options.iterations,
        exclusive: ClassReport::of(&exclusive),
        concurrent: ClassReport::of(&concurrent),
        teardown: ClassReport::of(&teardown),
        overlap_detected: record.overlap.load(Ordering::SeqCst),
        final_version: record.version.load(Ordering::SeqCst),
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        messages_per_sec: rate(handled, elapsed),
        coordinator: coordinator.stats(),
        scheduler: scheduler.stats(),
    };
    scheduler.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    out.heading(&format!("Coordinator ({})", report.coordinator.state));
    out.field("Exclusive", report.exclusive.delivered);
    out.field("Concurrent", report.concurrent.delivered);
    out.field("Teardown", report.teardown.delivered);
    out.field("Held claims", report.coordinator.held);
    out.field("Transitions", report.coordinator.transitions);
    out.field("Left queued", report.coordinator.pending);
    out.field("Version", report.final_version);
    out.field("Elapsed", format!("{:.2}ms", report.elapsed_ms));
    if report.overlap_detected {
        out.warning("Exclusive handler overlapped other work");
    } else {
        out.success("No overlap between exclusive and other handlers");
    }
    out.newline();
    out.newline();
    out.heading("Scheduler");
    out.plain(&report.scheduler.to_string());
    out.newline();
    out.flush();
    Ok(())
}
