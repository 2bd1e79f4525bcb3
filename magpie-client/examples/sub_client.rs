#[macro_use]
extern crate log;

use std::process;
use std::time::Duration;

use anyhow::{anyhow, Result};
use structopt::StructOpt;

use magpie_client::{
    Client, ConnectOptions, Context, MemoryPersistence, ProtocolVersion, QoS, Will,
};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "sub_client",
    about = "an MQTT version 3.1/3.1.1 client for subscribing to topics"
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

    /// The number of seconds between sending PING commands to the broker
    /// for the purposes of informing it we are still connected and functioning.
    #[structopt(short, long, default_value = "60")]
    keep_alive: u64,

    /// Resume the session the broker stored for this client id, if any.
    #[structopt(short = "c", long)]
    resume_session: bool,

    /// The topic on which to send a Will, in the event that the client disconnects unexpectedly.
    #[structopt(long)]
    will_topic: Option<String>,

    /// Specify a message that will be stored by the broker and sent out if this client disconnects unexpectedly.
    #[structopt(long)]
    will_payload: Option<String>,

    /// Provide a username to be used for authenticating with the broker.
    #[structopt(short, long)]
    username: Option<String>,

    /// Provide a password to be used for authenticating with the broker.
    #[structopt(short = "P", long)]
    password: Option<String>,

    /// Disconnect and exit the program immediately after the given count of messages have been received.
    #[structopt(short = "C", long)]
    count: Option<usize>,

    /// Specify the quality of service desired for the incoming messages.
    #[structopt(short, long, default_value = "0", parse(try_from_str = parse_qos))]
    qos: QoS,

    /// Print received messages as "topic payload" instead of "payload".
    #[structopt(short, long)]
    verbose: bool,

    /// The MQTT topics to subscribe to.
    #[structopt(required = true)]
    topic: Vec<String>,
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
        .unwrap_or_else(|| format!("sub_client{}", process::id()));

    let ctx = Context::new()?;
    let client = Client::create(
        &ctx,
        &server_uri,
        &client_id,
        Box::new(MemoryPersistence::new()),
    )?;

    let mut options = ConnectOptions::new()
        .with_protocol_version(opt.protocol_version)
        .with_keep_alive(Duration::from_secs(opt.keep_alive));
    if opt.resume_session {
        options = options.without_clean_session();
    }
    if let Some(ref username) = opt.username {
        options = options.with_credentials(username, opt.password.as_deref().map(str::as_bytes));
    }
    if let (Some(topic), Some(payload)) = (opt.will_topic.as_ref(), opt.will_payload.as_ref()) {
        options = options.with_last_will(Will::new(topic.as_str(), payload.as_bytes()));
    }

    client.connect(options)?;

    for topic in &opt.topic {
        let granted = client.subscribe(topic, opt.qos)?;
        info!("{} subscribed as `{}`", topic, granted);
    }

    let mut received = 0usize;
    let limit = opt.count.unwrap_or(usize::max_value());
    while received < limit {
        match client.receive(Duration::from_secs(1))? {
            Some(message) => {
                received += 1;
                if opt.verbose {
                    println!("{} {}", message.topic, String::from_utf8_lossy(&message.payload));
                } else {
                    println!("{}", String::from_utf8_lossy(&message.payload));
                }
            }
            None => continue,
        }
    }

    client.disconnect(Duration::from_secs(1))?;
    client.destroy()?;

    Ok(())
}
