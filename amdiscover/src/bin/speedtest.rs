use amlib::CancellationToken;
use clap::Parser;

use amdiscover::discovery::Discovery;

#[derive(Parser, Debug)]
#[command(version, about = "probe mirror latency and throughput", long_about = None)]
struct Args {
    /// mirror URLs to probe
    urls: Vec<String>,

    /// how many of the fastest responders get a throughput pass
    #[arg(long, default_value_t = 3)]
    top: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    let discovery = Discovery::builder().build().unwrap();

    let results = discovery
        .speed_test(&args.urls, args.top, &CancellationToken::new())
        .await;
    for r in results {
        match r.error {
            Some(e) => println!("{:>10} {:>12} {} ({})", "-", "-", r.url, e),
            None => println!(
                "{:>8}ms {:>10.1}kBps {}",
                r.latency_ms.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
                r.kbps.unwrap_or(0.0),
                r.url
            ),
        }
    }
}
