//! Measures CPU copy throughput between two chunks on concurrent threads.

use simaai_mem::mem::{AllocFlags, Chunk, Session, Target};
use simaai_mem::MemResult;
use std::process::ExitCode;
use std::time::{Duration, Instant};

const USAGE: &str = "\
Usage: copy_bench [OPTION]
Measure memcpy throughput between SiMa.ai memory chunks.

  -h, --help              display this help and exit
      --src=TARGET        source target (default generic)
      --dst=TARGET        destination target (default generic)
  -n, --threads=N         concurrent copy threads (default 1)
  -i, --iterations=N      copies per thread (default 100)
  -s, --size=SIZE         bytes per copy (default 1048576)
      --cached            allocate cacheable memory";

struct Args {
    src: Target,
    dst: Target,
    threads: usize,
    iterations: usize,
    size: usize,
    flags: AllocFlags,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        src: Target::Generic,
        dst: Target::Generic,
        threads: 1,
        iterations: 100,
        size: 1 << 20,
        flags: AllocFlags::new(),
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let (key, inline) = match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (arg.clone(), None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| it.next())
                .ok_or_else(|| format!("option '{key}' requires a value"))
        };

        match key.as_str() {
            "-h" | "--help" => return Err(String::new()),
            "--src" => args.src = value()?.parse().map_err(|e| format!("{e}"))?,
            "--dst" => args.dst = value()?.parse().map_err(|e| format!("{e}"))?,
            "-n" | "--threads" => {
                args.threads = value()?.parse().map_err(|_| "Invalid thread count")?;
            }
            "-i" | "--iterations" => {
                args.iterations = value()?.parse().map_err(|_| "Invalid iteration count")?;
            }
            "-s" | "--size" => {
                args.size = value()?.parse().map_err(|_| "Invalid size value")?;
            }
            "--cached" => args.flags = args.flags.cached(),
            other => return Err(format!("unknown option '{other}'")),
        }
    }

    if args.threads == 0 || args.iterations == 0 || args.size == 0 {
        return Err("threads, iterations and size must be nonzero".into());
    }
    Ok(args)
}

fn mapped(session: &Session, size: usize, target: Target, flags: AllocFlags) -> MemResult<Chunk> {
    let mut chunk = session.allocate(size, target, flags)?;
    if let Err(e) = chunk.map() {
        chunk.free()?;
        return Err(e);
    }
    Ok(chunk)
}

fn copy_worker(session: &Session, args: &Args, worker: usize) -> MemResult<Duration> {
    let mut src = mapped(session, args.size, args.src, args.flags)?;
    let mut dst = match mapped(session, args.size, args.dst, args.flags) {
        Ok(dst) => dst,
        Err(e) => {
            src.free()?;
            return Err(e);
        }
    };

    if let Some(bytes) = src.as_mut_slice() {
        bytes.fill(worker as u8);
    }
    src.flush_cache();

    let start = Instant::now();
    for _ in 0..args.iterations {
        src.invalidate_cache_part(0, args.size);
        if let (Some(from), Some(to)) = (src.as_slice(), dst.as_mut_slice()) {
            to[..args.size].copy_from_slice(&from[..args.size]);
        }
        dst.flush_cache_part(0, args.size);
    }
    let elapsed = start.elapsed();

    let freed_src = src.free();
    dst.free()?;
    freed_src?;
    Ok(elapsed)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter("simaai_mem=info")
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("{msg}");
            }
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    let session = match Session::open() {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Opening allocator failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "Copying {} bytes {} -> {} x{} on {} thread(s){}",
        args.size,
        args.src,
        args.dst,
        args.iterations,
        args.threads,
        if args.flags.cached { " (cached)" } else { "" }
    );

    let results: Vec<MemResult<Duration>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|worker| {
                let session = &session;
                let args = &args;
                s.spawn(move || copy_worker(session, args, worker))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .collect()
    });

    let mut failed = false;
    let bytes = (args.size * args.iterations) as f64;
    for (worker, result) in results.into_iter().enumerate() {
        match result {
            Ok(elapsed) => {
                let secs = elapsed.as_secs_f64().max(f64::EPSILON);
                println!(
                    "thread {worker}: {:.3} ms, {:.1} MiB/s",
                    secs * 1e3,
                    bytes / secs / (1024.0 * 1024.0)
                );
            }
            Err(e) => {
                eprintln!("thread {worker}: {e}");
                failed = true;
            }
        }
    }

    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}
