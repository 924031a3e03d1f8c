// Jackson Coxson
// Activates a device against Apple's activation server

use std::{error::Error, process::ExitCode};

use clap::{Arg, ArgAction, Command};
use idevice_activate::{
    Activator,
    cache::{CacheConfig, CacheStore},
    identity::Overrides,
    lockdown::LockdownClient,
    ticket,
    transport::HttpTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod common;

const CACHE_NOTICE: &str = "\
A cache keeps what a successful activation sent to Apple: the IMEI, IMSI, \
ICCID, serial number and ActivationInfo of this device, plus its UDID. Make \
one while the SIM of the carrier the device is locked to is inserted, and \
replay it later with -r to activate again without that SIM.

The files stay in the directory given with -c. Nothing in it is sent \
anywhere except in the activation request itself.

Devices without a SIM slot don't need a cache.

Press enter to continue or CONTROL-C to abort...";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let matches = Command::new("ideviceactivate")
        .about("Activate or deactivate an iOS device")
        .arg(
            Arg::new("deactivate")
                .short('x')
                .long("deactivate")
                .help("Deactivate the device instead of activating it")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable communication debugging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("udid")
                .short('u')
                .long("udid")
                .value_name("UDID")
                .help("Target the device with this UDID"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("IP address of the device"),
        )
        .arg(
            Arg::new("pairing_file")
                .long("pairing-file")
                .value_name("PATH")
                .help("Path to the pairing file"),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("FILE")
                .help("Apply the activation record in FILE instead of asking Apple"),
        )
        .arg(
            Arg::new("cache")
                .short('c')
                .long("cache")
                .value_name("DIR")
                .help("Back up the activation data to DIR")
                .conflicts_with("replay"),
        )
        .arg(
            Arg::new("replay")
                .short('r')
                .long("replay")
                .value_name("DIR")
                .help("Activate with the data backed up to DIR"),
        )
        .arg(
            Arg::new("imei")
                .long("imei")
                .value_name("IMEI")
                .help("Send this IMEI instead of the device's"),
        )
        .arg(
            Arg::new("imsi")
                .long("imsi")
                .value_name("IMSI")
                .help("Send this IMSI instead of the device's"),
        )
        .arg(
            Arg::new("iccid")
                .long("iccid")
                .value_name("ICCID")
                .help("Send this ICCID instead of the device's"),
        )
        .arg(
            Arg::new("serial")
                .long("serial")
                .value_name("SERIAL")
                .help("Send this serial number instead of the device's"),
        )
        .get_matches();

    let filter = if matches.get_flag("debug") {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&matches).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &clap::ArgMatches) -> Result<(), Box<dyn Error>> {
    let cache_config = if let Some(dir) = matches.get_one::<String>("cache") {
        println!("{CACHE_NOTICE}");
        BufReader::new(tokio::io::stdin())
            .read_line(&mut String::new())
            .await?;
        CacheConfig::backup(dir)
    } else if let Some(dir) = matches.get_one::<String>("replay") {
        CacheConfig::replay(dir)
    } else {
        CacheConfig::disabled()
    };
    let cache = CacheStore::new(cache_config)?;

    let overrides = Overrides {
        imei: matches.get_one::<String>("imei").cloned(),
        imsi: matches.get_one::<String>("imsi").cloned(),
        iccid: matches.get_one::<String>("iccid").cloned(),
        serial_number: matches.get_one::<String>("serial").cloned(),
    };

    let provider = common::get_provider(
        matches.get_one::<String>("udid"),
        matches.get_one::<String>("host"),
        matches.get_one::<String>("pairing_file"),
        "ideviceactivate",
    )
    .await?;

    let mut lockdown = LockdownClient::connect(&*provider).await?;
    let pairing_file = provider.get_pairing_file().await?;
    lockdown.start_session(&pairing_file).await?;
    debug!("Connected to lockdownd");

    let activator =
        Activator::new(lockdown, HttpTransport::new()?, cache).with_overrides(overrides);

    if matches.get_flag("deactivate") {
        activator.deactivate().await?;
        println!("Device deactivated");
    } else if let Some(file) = matches.get_one::<String>("file") {
        let record = ticket::read_record_from_file(file).await?;
        activator.activate_with_record(record).await?;
        println!("Device activated from {file}");
    } else {
        activator.activate().await?;
        println!("Device activated");
    }
    Ok(())
}
