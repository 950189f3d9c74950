//! pmucal: drive PMU sequence tables against simulated or real hardware

use anyhow::{anyhow, bail, Context};
use std::env;

use pmucal::config::Config;
use pmucal::device::{AddressMap, DevMemBackend, NoSecureMonitor, RegisterBackend, SecureMonitor, SimulatedMonitor, SimulatedPmu};
use pmucal::pmucal::{PmuContext, SMC_CP_FUNCTION_ID};
use pmucal::table::PmuTable;

const USAGE: &str = "\
Usage: pmucal [OPTIONS] <COMMAND>...

Options:
  --table FILE       PMU sequence table (default: PMUCAL_TABLE, config, or built-in demo)
  --devmem           Drive real registers through /dev/mem instead of the simulator
  --cpu N            Core on whose behalf low-power modes are entered (default 0)
  --dump-state       Print engine statistics and simulated registers at the end
  --sample-config    Print a sample configuration file and exit

Commands (executed in order):
  summary
  core-on N | core-off N | core-status N | core-release N
  cluster-on N | cluster-off N | cluster-status N
  option-on N | option-off N | option-status N
  pd-on NAME | pd-off NAME | pd-status NAME
  lpm-enter NAME | lpm-exit NAME | lpm-wakeup NAME
  cp-init | cp-status | cp-wait | cp-reset-assert | cp-reset-release
  cp-active-clear | cp-reset-req-clear | cp-dump-on | cp-dump-off";

/// Commands that take an argument.
const WITH_ARG: &[&str] = &[
    "core-on",
    "core-off",
    "core-status",
    "core-release",
    "cluster-on",
    "cluster-off",
    "cluster-status",
    "option-on",
    "option-off",
    "option-status",
    "pd-on",
    "pd-off",
    "pd-status",
    "lpm-enter",
    "lpm-exit",
    "lpm-wakeup",
];

/// Commands without an argument.
const NO_ARG: &[&str] = &[
    "summary",
    "cp-init",
    "cp-status",
    "cp-wait",
    "cp-reset-assert",
    "cp-reset-release",
    "cp-active-clear",
    "cp-reset-req-clear",
    "cp-dump-on",
    "cp-dump-off",
];

/// One command word with its optional argument.
#[derive(Debug)]
struct Op {
    word: String,
    arg: Option<String>,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return Ok(());
    }
    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }

    // Parse options and commands
    let mut table_path = None;
    let mut devmem = false;
    let mut dump_state = false;
    let mut cpu = 0usize;
    let mut ops = Vec::new();

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--table" => {
                table_path = Some(iter.next().ok_or_else(|| anyhow!("--table needs a file"))?.clone());
            }
            "--devmem" => devmem = true,
            "--dump-state" => dump_state = true,
            "--cpu" => {
                let n = iter.next().ok_or_else(|| anyhow!("--cpu needs a core number"))?;
                cpu = n.parse().with_context(|| format!("invalid core number '{}'", n))?;
            }
            word if WITH_ARG.contains(&word) => {
                let value = iter.next().ok_or_else(|| anyhow!("{} needs an argument", word))?;
                ops.push(Op {
                    word: word.to_string(),
                    arg: Some(value.clone()),
                });
            }
            word if NO_ARG.contains(&word) => ops.push(Op {
                word: word.to_string(),
                arg: None,
            }),
            other => bail!("unknown argument '{}'\n\n{}", other, USAGE),
        }
    }

    let config = Config::get();
    let table = match table_path.map(Into::into).or_else(|| config.table_path()) {
        Some(path) => PmuTable::from_file(&path)?,
        None => {
            log::info!("No table configured, using the built-in demo table");
            PmuTable::builtin()?
        }
    };
    let poll = config.poll_config();

    if devmem {
        let backend = DevMemBackend::open()?;
        let mut pmu = PmuContext::new(backend, NoSecureMonitor, &table, poll)?;
        run(&mut pmu, &table, &ops, cpu)?;
        if dump_state {
            println!();
            pmu.stats().print_summary();
            print_blocks(pmu.address_map());
        }
    } else {
        let function_id = table
            .cp
            .as_ref()
            .and_then(|cp| cp.secure.as_ref())
            .map_or(SMC_CP_FUNCTION_ID, |s| s.function_id);
        let sim = SimulatedPmu::with_model(&table.simulation);
        let mut pmu = PmuContext::new(sim, SimulatedMonitor::new(function_id), &table, poll)?;
        run(&mut pmu, &table, &ops, cpu)?;
        if dump_state {
            println!();
            pmu.stats().print_summary();
            print_blocks(pmu.address_map());
            println!();
            pmu.backend().print_state();
            println!();
            println!("Secure monitor calls: {}", pmu.monitor().calls().len());
        }
    }

    Ok(())
}

/// Execute the commands in order, stopping at the first failure.
fn run<B: RegisterBackend, S: SecureMonitor>(
    pmu: &mut PmuContext<B, S>,
    table: &PmuTable,
    ops: &[Op],
    cpu: usize,
) -> anyhow::Result<()> {
    for op in ops {
        let arg = op.arg.as_deref().unwrap_or("");
        let index = || -> anyhow::Result<usize> {
            arg.parse()
                .with_context(|| format!("{}: '{}' is not an index", op.word, arg))
        };
        let result = match op.word.as_str() {
            "summary" => {
                table.print_summary();
                Ok(String::new())
            }
            "core-on" => pmu.core_enable(index()?).map(|()| "on".to_string()),
            "core-off" => pmu.core_disable(index()?).map(|()| "off".to_string()),
            "core-status" => pmu.core_is_enabled(index()?).map(on_off),
            "core-release" => pmu.core_release(index()?).map(|()| "released".to_string()),
            "cluster-on" => pmu.cluster_enable(index()?).map(|()| "on".to_string()),
            "cluster-off" => pmu.cluster_disable(index()?).map(|()| "off".to_string()),
            "cluster-status" => pmu.cluster_is_enabled(index()?).map(on_off),
            "option-on" => pmu.option_enable(index()?).map(|()| "on".to_string()),
            "option-off" => pmu.option_disable(index()?).map(|()| "off".to_string()),
            "option-status" => pmu.option_is_enabled(index()?).map(on_off),
            "pd-on" => pmu.pd_index(arg).and_then(|pd| pmu.pd_enable(pd)).map(|()| "on".to_string()),
            "pd-off" => pmu.pd_index(arg).and_then(|pd| pmu.pd_disable(pd)).map(|()| "off".to_string()),
            "pd-status" => pmu.pd_index(arg).and_then(|pd| pmu.pd_is_enabled(pd)).map(on_off),
            "lpm-enter" => pmu
                .lpm_index(arg)
                .and_then(|mode| pmu.lpm_enter(mode, cpu))
                .map(|()| format!("entered by cpu {}", cpu)),
            "lpm-exit" => pmu
                .lpm_index(arg)
                .and_then(|mode| pmu.lpm_exit(mode, cpu))
                .map(|()| "exited".to_string()),
            "lpm-wakeup" => pmu
                .lpm_index(arg)
                .and_then(|mode| pmu.lpm_early_wakeup(mode, cpu))
                .map(|()| "woken early".to_string()),
            "cp-init" => pmu.cp_init().map(|()| "initialised".to_string()),
            "cp-status" => pmu.cp_status().map(|up| (if up { "online" } else { "offline" }).to_string()),
            "cp-wait" => pmu.cp_wait_online().map(|()| "online".to_string()),
            "cp-reset-assert" => pmu.cp_reset_assert().map(|()| "reset asserted".to_string()),
            "cp-reset-release" => pmu.cp_reset_release().map(|()| "reset released".to_string()),
            "cp-active-clear" => pmu.cp_active_clear().map(|()| "active cleared".to_string()),
            "cp-reset-req-clear" => pmu.cp_reset_req_clear().map(|()| "reset request cleared".to_string()),
            "cp-dump-on" => pmu.cp_enable_dump().map(|()| "dump enabled".to_string()),
            "cp-dump-off" => pmu.cp_disable_dump().map(|()| "dump disabled".to_string()),
            other => bail!("unknown command '{}'", other),
        };

        let outcome = result.with_context(|| match &op.arg {
            Some(arg) => format!("{} {} failed", op.word, arg),
            None => format!("{} failed", op.word),
        })?;
        if !outcome.is_empty() {
            match &op.arg {
                Some(arg) => println!("{} {}: {}", op.word, arg, outcome),
                None => println!("{}: {}", op.word, outcome),
            }
        }
    }
    Ok(())
}

fn print_blocks(map: &AddressMap) {
    println!("Mapped blocks:");
    for block in map.blocks() {
        println!(
            "  {:<16} 0x{:08X} +0x{:X} -> 0x{:X}",
            block.name, block.phys_base, block.size, block.base
        );
    }
}

fn on_off(enabled: bool) -> String {
    let word = if enabled { "on" } else { "off" };
    word.to_string()
}
