use crate::Cli;
use facet::Facet;
use powermetrics::{CpuUsage, CpuUsageTracker, Pass, PowerMetrics, PowerMetricsConfig, PowerSample};
use powermetrics_types::{CoreClass, CoreTicks, SampleReport, ThreadSample};
use std::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_PASSES: usize = 2;
const TOP_ADDRESSES: usize = 20;

#[derive(Facet, Debug)]
struct PassLine {
    pass: usize,
    power: PowerSample,
    report: Option<SampleReport>,
    cpu: Option<CpuUsage>,
}

#[derive(Facet, Debug)]
struct HotAddress {
    address: u64,
    energy_wh: f64,
}

#[derive(Facet, Debug)]
struct Summary {
    passes: usize,
    total_energy_wh: f64,
    max_power_watts: f64,
    average_power_watts: f64,
    hot_addresses: Vec<HotAddress>,
}

pub(crate) fn sample_loop(cli: &Cli, config: PowerMetricsConfig) -> Result<(), String> {
    let passes = cli.count.unwrap_or(DEFAULT_PASSES);
    let interval = config.sampling_interval;
    let mut metrics = PowerMetrics::native(config);
    let mut usage = CpuUsageTracker::new();

    info!(passes, interval_ms = interval.as_millis() as u64, "sampling");
    for pass in 0..passes {
        if pass > 0 {
            std::thread::sleep(interval);
        }
        let result = metrics
            .sample_once(Instant::now())
            .map_err(|e| e.to_string())?;
        log_hottest_thread(pass, &result);
        let cpu = if cli.cpu {
            match powermetrics_capture::cpu_usage_snapshot() {
                Ok(snapshot) => usage.update(snapshot),
                Err(status) => {
                    warn!(%status, "cpu usage unavailable");
                    None
                }
            }
        } else {
            None
        };
        if let Some(cpu) = &cpu {
            let system = cpu.cores.iter().map(CoreTicks::system_usage).fold(0.0, f64::max);
            debug!(pass, overall = cpu.overall(), max_core_system = system, "cpu usage");
        }
        let line = PassLine {
            pass,
            power: result.power,
            report: cli.report.then_some(result.report),
            cpu,
        };
        let json = facet_json::to_string(&line).map_err(|e| format!("encode pass: {e}"))?;
        println!("{json}");
    }

    let mut hot_addresses: Vec<HotAddress> = metrics
        .graph()
        .flat()
        .into_iter()
        .map(|(address, energy_wh)| HotAddress { address, energy_wh })
        .collect();
    hot_addresses.sort_by(|a, b| b.energy_wh.total_cmp(&a.energy_wh));
    hot_addresses.truncate(TOP_ADDRESSES);

    let (max_power_watts, average_power_watts) = {
        let history = metrics.history();
        let history = history.lock();
        let stored = history.samples().len().max(1) as f64;
        let sum: f64 = history.samples().map(|s| s.all_threads.total()).sum();
        (history.max_power(), sum / stored)
    };
    let summary = Summary {
        passes,
        total_energy_wh: metrics.total_energy_wh(),
        max_power_watts,
        average_power_watts,
        hot_addresses,
    };
    let json = facet_json::to_string(&summary).map_err(|e| format!("encode summary: {e}"))?;
    println!("{json}");
    Ok(())
}

fn log_hottest_thread(pass: usize, result: &Pass) {
    let Some(hottest) = result
        .power
        .threads
        .iter()
        .max_by(|a, b| a.power.total().total_cmp(&b.power.total()))
    else {
        return;
    };
    let name = result
        .report
        .thread(hottest.thread_id)
        .map(ThreadSample::display_name)
        .unwrap_or_default();
    let split = CoreClass::ALL
        .map(|class| format!("{}={:.3}W", class.short_name(), hottest.power.get(class)))
        .join(" ");
    info!(pass, thread = %name, counter = hottest.counter, "hottest thread: {split}");
}
