#[macro_use]
extern crate log;

use std::process;
use std::time::Duration;

use anyhow::{anyhow, Result};
use structopt::StructOpt;

use magpie_client::{Client, ConnectOptions, Context, MemoryPersistence, ProtocolVersion, QoS};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pub_client",
    about = "an MQTT version 3.1/3.1.1 client for publishing messages"
)]
struct Opt {
    /// Specify the host to connect to.
    #[structopt(short, long, default_value = "localhost")]
    host: String,

    /// Connect to the port specified.
    #[structopt(short, long, default_value = "1883")]
    port: u16,

    /// Specify which version of the MQTT protocol should be used when connecting to the remote broker.
    #[structopt(short = "V", long, default_value = "311", parse(try_from_str = parse_protocol_version))]
    protocol_version: ProtocolVersion,

    /// The id to use for this client.
    #[structopt(short, long)]
    id: Option<String>,

    /// Provide a username to be used for authenticating with the broker.
    #[structopt(short, long)]
    username: Option<String>,

    /// Provide a password to be used for authenticating with the broker.
    #[structopt(short = "P", long)]
    password: Option<String>,

    /// Specify the quality of service to use for the message.
    #[structopt(short, long, default_value = "0", parse(try_from_str = parse_qos))]
    qos: QoS,

    /// Retain the message on the broker for future subscribers.
    #[structopt(short, long)]
    retain: bool,

    /// The topic to publish to.
    topic: String,

    /// The message payload to send.
    message: String,
}

fn parse_protocol_version(s: &str) -> Result<ProtocolVersion> {
    match s {
        "v3" | "31" | "3.1" => Ok(ProtocolVersion::V31),
        "v4" | "311" | "3.1.1" => Ok(ProtocolVersion::V311),
        _ => Err(anyhow!("invalid protocol version: {}", s)),
    }
}

fn parse_qos(s: &str) -> Result<QoS> {
    match s {
        "0" | "at-most-once" => Ok(QoS::AtMostOnce),
        "1" | "at-least-once" => Ok(QoS::AtLeastOnce),
        "2" | "exactly-once" => Ok(QoS::ExactlyOnce),
        _ => Err(anyhow!("invalid QoS: {}", s)),
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("{:#?}", opt);

    let server_uri = format!("tcp://{}:{}", opt.host, opt.port);
    let client_id = opt
        .id
        .clone()
        .unwrap_or_else(|| format!("pub_client{}", process::id()));

    let ctx = Context::new()?;
    let client = Client::create(
        &ctx,
        &server_uri,
        &client_id,
        Box::new(MemoryPersistence::new()),
    )?;

    let mut options = ConnectOptions::new().with_protocol_version(opt.protocol_version);
    if let Some(ref username) = opt.username {
        options = options.with_credentials(username, opt.password.as_deref().map(str::as_bytes));
    }

    client.connect(options)?;

    let token = client.publish(&opt.topic, opt.message.as_bytes(), opt.qos, opt.retain)?;
    if let Some(token) = token {
        client.wait_for_completion(token, Duration::from_secs(10))?;
        info!("message {} delivered", token);
    }

    client.disconnect(Duration::from_secs(1))?;
    client.destroy()?;

    Ok(())
}
