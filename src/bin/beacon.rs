use std::env;
use std::sync::Arc;

use getopts::Options;

use beacon::dns::context::{ServerConfig, ServerContext};
use beacon::dns::server::{DnsServer, DnsTcpServer, DnsUdpServer};
use beacon::web::server::WebServer;

/// Responder threads per DNS transport.
const THREAD_COUNT: usize = 4;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the Beacon DDNS server
fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("c", "config", "path to the server configuration file", "FILE");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => panic!("{}", f.to_string()),
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let config_path = opt_matches
        .opt_str("c")
        .unwrap_or_else(|| "beacon.yaml".to_string());

    let config = match ServerConfig::from_file(&config_path) {
        Ok(x) => x,
        Err(e) => {
            log::error!("Failed to load configuration from `{}`: {}", config_path, e);
            std::process::exit(1);
        }
    };

    let context = Arc::new(ServerContext::from_config(config));

    log::info!(
        "serving {} allow-listed name(s)",
        context.allowed_names.len()
    );

    let udp_server = DnsUdpServer::new(context.clone(), THREAD_COUNT);
    if let Err(e) = udp_server.run_server() {
        log::error!("Failed to bind UDP listener: {:?}", e);
        std::process::exit(1);
    }

    let tcp_server = DnsTcpServer::new(context.clone(), THREAD_COUNT);
    if let Err(e) = tcp_server.run_server() {
        log::error!("Failed to bind TCP listener: {:?}", e);
        std::process::exit(1);
    }

    // The update API keeps the main thread busy
    let webserver = WebServer::new(context);
    webserver.run_webserver();
}
