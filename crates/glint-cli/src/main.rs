use std::{env, fs, process::ExitCode, time::Instant};

use glint::Engine;

/// Arena size for the CLI's engine. Large enough for interactive scripts
/// and small demo files without the host needing to size it itself.
const DEFAULT_ARENA_BYTES: usize = 64 * 1024;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut dump = false;
    let mut verbose = false;
    let mut gc_threshold: Option<u32> = None;
    let mut sources: Vec<Source> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-e" => {
                i += 1;
                let Some(expr) = args.get(i) else {
                    eprintln!("error: -e requires an argument");
                    return ExitCode::FAILURE;
                };
                sources.push(Source::Inline(expr.clone()));
            }
            "-d" => dump = true,
            "-v" => verbose = true,
            "-gct" => {
                i += 1;
                let Some(n) = args.get(i).and_then(|s| s.parse::<u32>().ok()) else {
                    eprintln!("error: -gct requires an integer argument");
                    return ExitCode::FAILURE;
                };
                gc_threshold = Some(n);
            }
            other => sources.push(Source::File(other.to_owned())),
        }
        i += 1;
    }

    let mut engine = match Engine::create(DEFAULT_ARENA_BYTES) {
        Ok(e) => e,
        Err(err) => {
            eprintln!("error: failed to create engine: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(n) = gc_threshold {
        engine.set_gc_threshold(n);
    }

    let start = Instant::now();
    for source in &sources {
        let code = match source {
            Source::Inline(expr) => expr.clone(),
            Source::File(path) => match fs::read_to_string(path) {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("error reading {path}: {err}");
                    return ExitCode::FAILURE;
                }
            },
        };
        let value = engine.eval(&code);
        println!("{}", engine.str(value));
    }

    if verbose {
        let elapsed = start.elapsed();
        eprintln!(
            "Executed in {:.3} ms. Mem usage is {}% of {} bytes.",
            elapsed.as_secs_f64() * 1000.0,
            engine.usage(),
            engine.capacity(),
        );
    }

    if dump {
        eprintln!(
            "arena: {}/{} bytes allocated ({}% used), {} pinned callback(s)",
            engine.allocated(),
            engine.capacity(),
            engine.usage(),
            engine.pinned_count(),
        );
    }

    ExitCode::SUCCESS
}

enum Source {
    Inline(String),
    File(String),
}
