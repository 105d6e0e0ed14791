use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use task_core::{
    logging, JobPriority, JobScheduler, LoaderRegistry, SchedulerConfig, TaskHandle, TaskKind,
    TaskOutput, TaskRequest, TaskSystem,
};

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 10;
const EXIT_SCHEDULER: i32 = 11;
const EXIT_TASK: i32 = 12;

#[derive(Parser)]
#[command(name = "tools", version, about = "Job scheduler tools CLI")]
struct Cli {
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a burst of custom tasks across all priorities.
    Burst(BurstArgs),
    /// Run a dependency chain and check it executes in order.
    Chain(ChainArgs),
    /// Load every file in a directory as texture or blob tasks.
    Load(LoadArgs),
}

#[derive(Parser)]
struct BurstArgs {
    #[arg(long, default_value_t = 64)]
    count: usize,

    #[arg(long, default_value_t = 2)]
    work_ms: u64,
}

#[derive(Parser)]
struct ChainArgs {
    #[arg(long, default_value_t = 8)]
    length: usize,
}

#[derive(Parser)]
struct LoadArgs {
    #[arg(long, value_name = "DIR")]
    dir: PathBuf,

    #[arg(long, value_enum, default_value_t = LoadKind::Auto)]
    kind: LoadKind,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(ValueEnum, Clone, Copy, PartialEq, Eq)]
enum LoadKind {
    Auto,
    Texture,
    Blob,
}

fn main() {
    logging::init_default();
    let cli = Cli::parse();
    let scheduler = match build_scheduler(cli.config.as_deref(), cli.workers) {
        Ok(scheduler) => scheduler,
        Err(code) => std::process::exit(code),
    };
    let tasks = TaskSystem::new(Arc::clone(&scheduler), LoaderRegistry::with_defaults());
    let exit_code = match cli.command {
        Commands::Burst(args) => run_burst(&tasks, args),
        Commands::Chain(args) => run_chain(&tasks, args),
        Commands::Load(args) => run_load(&tasks, args),
    };
    drop(tasks);
    scheduler.shutdown();
    std::process::exit(exit_code);
}

fn build_scheduler(config: Option<&Path>, workers: Option<usize>) -> Result<Arc<JobScheduler>, i32> {
    let mut config = match config {
        Some(path) => SchedulerConfig::load(path).map_err(|err| {
            eprintln!("{}", err);
            EXIT_CONFIG
        })?,
        None => SchedulerConfig::default(),
    };
    if workers.is_some() {
        config.worker_count = workers;
    }
    match JobScheduler::new(config) {
        Ok(scheduler) => Ok(Arc::new(scheduler)),
        Err(err) => {
            eprintln!("scheduler start failed: {}", err);
            Err(EXIT_SCHEDULER)
        }
    }
}

fn run_burst(tasks: &TaskSystem, args: BurstArgs) -> i32 {
    let started = Instant::now();
    let fired = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(args.count);
    for index in 0..args.count {
        let priority = JobPriority::ALL[index % JobPriority::ALL.len()];
        let work = Duration::from_millis(args.work_ms);
        let request = TaskRequest::custom(move || {
            std::thread::sleep(work);
            Ok(index as u64 * index as u64)
        });
        let handle = match tasks.create_task(request, priority) {
            Ok(handle) => handle,
            Err(err) => {
                eprintln!("task {} create failed: {}", index, err);
                return EXIT_TASK;
            }
        };
        let fired = Arc::clone(&fired);
        let registered = tasks.on_complete(handle, move |_| {
            fired.fetch_add(1, Ordering::Relaxed);
        });
        if let Err(err) = registered.and_then(|()| tasks.submit_task(handle)) {
            eprintln!("task {} submit failed: {}", index, err);
            return EXIT_TASK;
        }
        handles.push(handle);
    }

    let mut processed = 0;
    while processed < handles.len() {
        processed += tasks.process_completed_tasks(0);
        std::thread::sleep(Duration::from_millis(1));
    }
    let telemetry = tasks.scheduler().telemetry();
    let failed = handles.iter().filter(|handle| tasks.has_failed(**handle)).count();
    for handle in handles {
        let _ = tasks.free_task(handle);
    }
    println!(
        "burst ok (tasks={}, callbacks={}, failed={}, workers={}, elapsed={:?})",
        args.count,
        fired.load(Ordering::Relaxed),
        failed,
        telemetry.workers,
        started.elapsed()
    );
    println!(
        "totals: completed={} failed={} cancelled={}",
        telemetry.jobs_completed, telemetry.jobs_failed, telemetry.jobs_cancelled
    );
    if failed > 0 {
        return EXIT_TASK;
    }
    EXIT_SUCCESS
}

fn run_chain(tasks: &TaskSystem, args: ChainArgs) -> i32 {
    if args.length == 0 {
        eprintln!("--length must be at least 1");
        return EXIT_USAGE;
    }
    let order = Arc::new(Mutex::new(Vec::with_capacity(args.length)));
    let mut handles: Vec<TaskHandle> = Vec::with_capacity(args.length);
    for step in 0..args.length {
        let order = Arc::clone(&order);
        let request = TaskRequest::custom(move || {
            order
                .lock()
                .map_err(|_| "order lock poisoned".to_string())?
                .push(step);
            Ok(step)
        });
        let handle = match tasks.create_task(request, JobPriority::Normal) {
            Ok(handle) => handle,
            Err(err) => {
                eprintln!("step {} create failed: {}", step, err);
                return EXIT_TASK;
            }
        };
        if let Some(previous) = handles.last() {
            if let Err(err) = tasks.add_dependency(handle, *previous) {
                eprintln!("step {} dependency failed: {}", step, err);
                return EXIT_TASK;
            }
        }
        handles.push(handle);
    }
    // Submit back to front so every dependent waits before its dependency runs.
    for handle in handles.iter().rev() {
        if let Err(err) = tasks.submit_task(*handle) {
            eprintln!("{} submit failed: {}", handle, err);
            return EXIT_TASK;
        }
    }
    let Some(last) = handles.last().copied() else {
        return EXIT_USAGE;
    };
    tasks.wait_for_task(last, None);
    tasks.process_completed_tasks(0);

    let observed = order.lock().map(|order| order.clone()).unwrap_or_default();
    let expected: Vec<usize> = (0..args.length).collect();
    for handle in handles {
        let _ = tasks.free_task(handle);
    }
    if observed != expected {
        eprintln!("chain ran out of order: {:?}", observed);
        return EXIT_TASK;
    }
    println!("chain ok (length={})", args.length);
    EXIT_SUCCESS
}

fn run_load(tasks: &TaskSystem, args: LoadArgs) -> i32 {
    let entries = match std::fs::read_dir(&args.dir) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("{}: {}", args.dir.display(), err);
            return EXIT_USAGE;
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut handles = Vec::with_capacity(paths.len());
    for path in &paths {
        let result = match resolve_kind(args.kind, path) {
            TaskKind::Texture => tasks.load_texture(path, JobPriority::High),
            _ => tasks.load_blob(path, JobPriority::Normal),
        };
        match result {
            Ok(handle) => handles.push((path, handle)),
            Err(err) => {
                eprintln!("{}: {}", path.display(), err);
                return EXIT_TASK;
            }
        }
    }

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut failures = 0;
    for (path, handle) in &handles {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !tasks.wait_for_task(*handle, Some(remaining)) {
            eprintln!("{}: timed out", path.display());
            failures += 1;
            continue;
        }
        if tasks.has_failed(*handle) {
            let message = tasks.error_message(*handle).unwrap_or_default();
            eprintln!("{}: {}", path.display(), message);
            failures += 1;
        }
    }

    let reported = Arc::new(Mutex::new(Vec::new()));
    for (path, handle) in &handles {
        let reported = Arc::clone(&reported);
        let label = path.display().to_string();
        let _ = tasks.on_complete(*handle, move |done| {
            let line = match done.take_output() {
                Ok(TaskOutput::Texture(texture)) => format!(
                    "{}: texture {}x{} ({} bytes)",
                    label,
                    texture.width,
                    texture.height,
                    texture.byte_len()
                ),
                Ok(TaskOutput::Blob(bytes)) => format!("{}: blob {} bytes", label, bytes.len()),
                Ok(other) => format!("{}: {:?}", label, other.kind()),
                Err(_) => return,
            };
            if let Ok(mut reported) = reported.lock() {
                reported.push(line);
            }
        });
    }
    tasks.process_completed_tasks(0);
    if let Ok(reported) = reported.lock() {
        for line in reported.iter() {
            println!("{}", line);
        }
    }
    for (_, handle) in handles {
        let _ = tasks.free_task(handle);
    }

    tracing::info!(files = paths.len(), failures, "load finished");
    if failures > 0 {
        return EXIT_TASK;
    }
    EXIT_SUCCESS
}

fn resolve_kind(kind: LoadKind, path: &Path) -> TaskKind {
    match kind {
        LoadKind::Texture => TaskKind::Texture,
        LoadKind::Blob => TaskKind::Blob,
        LoadKind::Auto => {
            let is_png = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            if is_png {
                TaskKind::Texture
            } else {
                TaskKind::Blob
            }
        }
    }
}
