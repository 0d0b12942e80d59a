use std::process::ExitCode;

use env_logger::Env;

use queue_latency::configuration::{Configuration, Parser};

/// Captured packets buffered between the queue reader and the interceptor.
#[cfg(target_os = "linux")]
const PACKET_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        log::error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }
    log::info!("Configuration valid. Starting up as {}...", conf.role);

    match run(conf).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
async fn run(conf: Configuration) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use queue_latency::{
        interceptor::Interceptor,
        prober::Prober,
        queue::{nfqueue::NfQueue, VerdictSink},
        roles::Role,
        rules::{ensure_rules, rules_for},
        stats::{AckStats, TelemetrySink},
        transmit::{PnetSender, ResponderTransmitter},
    };

    let queue_num = conf.queue_num();
    if conf.skip_rules {
        log::info!("Skipping iptables provisioning");
    } else {
        ensure_rules(&rules_for(
            conf.role,
            conf.initiator_port,
            conf.responder_port,
            queue_num,
        ))?;
    }

    let queue = Arc::new(NfQueue::open(queue_num, conf.queue_max_len, conf.copy_range)?);
    log::info!("Bound to NFQUEUE {}", queue_num);

    let (packet_tx, packet_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
    let reader = Arc::clone(&queue).spawn_reader(packet_tx)?;
    let verdicts: Arc<dyn VerdictSink> = queue;

    let (transmitter, transmit_worker) = if conf.needs_raw_socket() {
        let (transmitter, worker) = ResponderTransmitter::spawn(PnetSender::open()?)?;
        (Some(transmitter), Some(worker))
    } else {
        log::info!("No probe target, raw socket not opened");
        (None, None)
    };
    let stats = Arc::new(AckStats::new());
    let shutdown = CancellationToken::new();

    let interceptor = match conf.role {
        Role::Responder => {
            let transmitter = transmitter.clone().ok_or("responder has no raw socket")?;
            Interceptor::responder(verdicts, transmitter)
        }
        Role::Initiator => {
            let sink: Arc<dyn TelemetrySink> = stats.clone();
            Interceptor::initiator(verdicts, sink)
        }
    }
    .with_idle_interval(conf.idle_interval());

    let prober = conf.probe_target().zip(transmitter.clone()).map(|(target, transmitter)| {
        let prober = Prober::new(
            target,
            conf.probe_interval(),
            transmitter,
            Arc::clone(&stats),
        );
        tokio::spawn(prober.run(shutdown.clone()))
    });
    drop(transmitter);

    let interceptor = tokio::spawn(interceptor.run(packet_rx, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");
    shutdown.cancel();

    if let Some(prober) = prober {
        prober.await?;
    }
    interceptor.await?;

    // The interceptor dropped the packet channel; the reader notices within its read timeout.
    tokio::task::spawn_blocking(move || {
        let _ = reader.join();
        if let Some(worker) = transmit_worker {
            let _ = worker.join();
        }
    })
    .await?;

    if conf.role == Role::Initiator {
        stats.snapshot().print(conf.output_format);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_conf: Configuration) -> Result<(), Box<dyn std::error::Error>> {
    Err("NFQUEUE capture is only available on Linux".into())
}
