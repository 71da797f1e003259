//! Walk through the usual Deferred scenarios from the command line
//!
//! Each subcommand plays the part of one request handler: it builds a
//! Deferred, registers callbacks on it, and prints whatever the chain ends up
//! producing. Set RUST_LOG=chained_deferred=trace to watch the chains drain.

use chained_deferred::executor::CallbackExecutor;
use chained_deferred::executor::queued::QueuedCallbackExecutor;
use chained_deferred::multithread::{blocking, timer};
use chained_deferred::{bind_cancellation, inline_callbacks, Deferred,
                       ErrorValue, FinishSignal, PoolConfig, ThreadPool};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};


#[derive(Parser)]
#[command(name = "chained-deferred-demo", version,
          about = "Replay request handlers built on Deferreds")]
struct Cli {
    /// Worker threads used for offloaded work
    #[arg(long, env = "DEFERRED_WORKERS", default_value_t = 2)]
    workers: usize,

    #[command(subcommand)]
    command: Command,
}


#[derive(Subcommand)]
enum Command {
    /// Underline and italicise some text through a callback chain
    Simple {
        #[arg(default_value = "This is a simple callback...FIRE!")]
        text: String,
    },

    /// Recover from a failing operation with an errback
    Error,

    /// Sequence several asynchronous steps in an async block
    Coro,

    /// Run a blocking task on the worker pool
    Sleep {
        #[arg(default_value_t = 1)]
        seconds: u64,
    },

    /// Render after a delay, unless the client goes away first
    Interrupted {
        #[arg(long, default_value_t = 5000)]
        delay_ms: u64,

        /// Simulate a client disconnect after this many milliseconds
        #[arg(long)]
        abort_after_ms: Option<u64>,
    },

    /// Log how long a request took once it is finished
    Onfinish,

    /// Hash a page chunk by chunk, yielding between chunks
    Phish {
        /// File standing in for the fetched page (a built-in page if absent)
        path: Option<PathBuf>,
    },
}


/// Page hashed when no file is given
const SAMPLE_PAGE: &str = "<html><head><title>Deferreds</title></head>\
                           <body>Nothing to see here.</body></html>";

/// Bytes hashed between two suspension points
const HASH_CHUNK: usize = 1024;


/// Enclose text in an HTML tag
fn add_tag(text: String, tag: &str) -> Result<String, ErrorValue> {
    Ok(format!("<{0}>{1}</{0}>", tag, text))
}


fn simple(text: String) -> Result<String, Box<dyn Error>> {
    let d = Deferred::new();
    d.add_callback(|s| add_tag(s, "i"))
     .add_callback(|s| add_tag(s, "u"));
    d.fire(text)?;
    Ok(blocking::block_on(&d)??)
}


fn error() -> Result<String, Box<dyn Error>> {
    let d = Deferred::maybe_deferred(|| -> Result<String, ErrorValue> {
        let n: i32 = "hello".parse()?;
        Ok(n.to_string())
    });
    d.add_errback(|failure| {
         Ok(format!("Uh oh spaghetti-Os!<br><br>ERROR: {}", failure))
     })
     .add_callback(|s| add_tag(s, "strong"));
    Ok(blocking::block_on(&d)??)
}


fn coro() -> Result<String, Box<dyn Error>> {
    let d = inline_callbacks(async {
        let text = "This is a coroutine-like function!".to_owned();
        let result = Deferred::maybe_deferred(|| add_tag(text, "i")).await?;
        let result = Deferred::maybe_deferred(|| add_tag(result, "strong"))
            .await?;
        let result = Deferred::maybe_deferred(|| add_tag(result, "body"))
            .await?;
        Deferred::maybe_deferred(|| add_tag(result, "html")).await
    });
    Ok(blocking::block_on(&d)??)
}


fn sleep(pool: &ThreadPool, seconds: u64) -> Result<String, Box<dyn Error>> {
    let executor = QueuedCallbackExecutor::new();
    let d = pool.offload_to(executor.channel(), move |_| {
        thread::sleep(Duration::from_secs(seconds));
        Ok::<_, ErrorValue>(format!("Slept for {} seconds", seconds))
    });
    d.add_callback(|s| add_tag(s, "h1"));

    // Turn the event loop until the result has gone through the chain
    let probe = d.clone();
    executor.run_until(move || probe.status().is_resolved(),
                       Duration::from_secs(seconds + 5));
    Ok(blocking::block_on(&d)??)
}


fn interrupted(delay: Duration, abort_after: Option<Duration>)
    -> Result<String, Box<dyn Error>>
{
    let request = FinishSignal::new();

    // The pending render is a delayed call, which the canceller aborts
    let render = Deferred::<String>::new();
    let target = render.clone();
    let call = timer::call_later(delay, move || {
        let _ = target.fire("Sorry for the delay".to_owned());
    })?;
    let render_call = call.clone();
    let d = Deferred::<String>::with_canceller(move || {
        println!("Cancelled!");
        render_call.cancel();
    });
    render.chain_deferred(d.clone());
    bind_cancellation(&d, &request);

    if let Some(after) = abort_after {
        let client = request.clone();
        timer::call_later(after, move || {
            client.abort(ErrorValue::msg("connection lost"));
        })?;
    }

    match blocking::block_on(&d) {
        Ok(result) => {
            request.finish();
            Ok(result?)
        }
        Err(e) => Ok(format!("request ended early: {}", e)),
    }
}


/// SHA-256 of a page, computed one chunk per suspension point
fn hash_page(page: Deferred<Vec<u8>>) -> Deferred<String> {
    inline_callbacks(async move {
        let bytes = page.await?;
        let mut hasher = Sha256::new();
        for chunk in bytes.chunks(HASH_CHUNK) {
            hasher.update(chunk);
            Deferred::<()>::succeed(()).await?;
        }
        let digest = hasher.finalize();
        Ok::<_, ErrorValue>(digest.iter()
                                  .map(|byte| format!("{:02x}", byte))
                                  .collect())
    })
}


fn phish(pool: &ThreadPool, path: Option<PathBuf>)
    -> Result<String, Box<dyn Error>>
{
    let page = match path {
        Some(path) => pool.offload(move || fs::read(path)),
        None => Deferred::succeed(SAMPLE_PAGE.as_bytes().to_vec()),
    };
    let d = hash_page(page);
    d.add_callback(|s| add_tag(s, "h1"))
     .add_callback(|s| add_tag(s, "body"))
     .add_callback(|s| add_tag(s, "html"));
    Ok(blocking::block_on(&d)??)
}


fn onfinish() -> Result<String, Box<dyn Error>> {
    let request = FinishSignal::new();
    let begin = Instant::now();
    request.notify_finish().add_callback(move |()| {
        tracing::info!(elapsed = ?begin.elapsed(), "request finished");
        println!("end - start time = {:?}", begin.elapsed());
        Ok(())
    });
    let answer = format!("Start Time: {:?}", begin);
    request.finish();
    Ok(answer)
}


fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let answer = match cli.command {
        Command::Simple { text } => simple(text)?,
        Command::Error => error()?,
        Command::Coro => coro()?,
        Command::Sleep { seconds } => {
            let pool = ThreadPool::new(PoolConfig::default()
                                           .workers(cli.workers))?;
            sleep(&pool, seconds)?
        }
        Command::Interrupted { delay_ms, abort_after_ms } => {
            interrupted(Duration::from_millis(delay_ms),
                        abort_after_ms.map(Duration::from_millis))?
        }
        Command::Onfinish => onfinish()?,
        Command::Phish { path } => {
            let pool = ThreadPool::new(PoolConfig::default()
                                           .workers(cli.workers))?;
            phish(&pool, path)?
        }
    };
    println!("{}", answer);
    Ok(())
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    /// Check that hashing in chunks matches hashing in one go, across
    /// several chunk boundaries
    #[test]
    fn chunked_hash() {
        let bytes = (0..10 * HASH_CHUNK + 17).map(|i| (i % 251) as u8)
                                             .collect::<Vec<u8>>();
        let expected = Sha256::digest(&bytes)
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect::<String>();
        let d = hash_page(Deferred::succeed(bytes));
        assert_eq!(d.result().unwrap().unwrap(), expected);
    }

    /// Check the whole scenario on the built-in page
    #[test]
    fn phish_sample_page() {
        let pool = ThreadPool::new(PoolConfig::default().workers(1)).unwrap();
        let page = phish(&pool, None).unwrap();
        assert!(page.starts_with("<html><body><h1>"));
        assert!(page.ends_with("</h1></body></html>"));
        assert_eq!(page.len(), "<html><body><h1>".len() + 64
                               + "</h1></body></html>".len());
    }
}
