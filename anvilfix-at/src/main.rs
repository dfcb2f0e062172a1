use anvilfix::fix::encode::{formatted_time, MessageBuilder, SerializedInt};
use anvilfix::fix::fields::{self, ExecType, MsgType, OrdStatus, Tags};
use anvilfix::fix::mem::MsgBuf;
use anvilfix::{
    ApplicationError, ChannelHandler, EngineSettings, FixEngine, FixInitiator, RecvHandler,
    SessionRef, SessionSettings,
};
use clap::{Parser, ValueHint};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = s.parse()?;
    Ok(std::time::Duration::from_secs(seconds))
}

#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
struct Opts {
    /// SenderCompId
    #[arg(short, long)]
    sender_comp_id: String,

    /// TargetCompId (ignored in listen mode; peers identify themselves)
    #[arg(short, long, default_value = "")]
    target_comp_id: String,

    /// Address to listen or connect
    #[arg(short, long)]
    addr: SocketAddr,

    /// Listen (opposite is connect)
    #[arg(short, long)]
    listen: bool,

    /// Location of the datastore: a file when connecting, a directory when
    /// listening
    #[arg(short = 'r', long, value_hint = ValueHint::FilePath)]
    store: PathBuf,

    /// Location of wire journal files
    #[arg(short = 'o', long, value_hint = ValueHint::FilePath)]
    log: PathBuf,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "30", value_parser = parse_duration)]
    heartbeat: Duration,

    /// Optional Username(553) for the logon
    #[arg(long)]
    username: Option<String>,

    /// Optional Password(554) for the logon
    #[arg(long)]
    password: Option<String>,
}

fn field(frame: &[u8], tag: u32) -> Option<String> {
    let prefix = format!("{}=", tag);
    for part in frame.split(|b| *b == 1) {
        if part.starts_with(prefix.as_bytes()) {
            return Some(String::from_utf8_lossy(&part[prefix.len()..]).into_owned());
        }
    }
    None
}

/// Acknowledge every inbound order with a `New` ExecutionReport.
struct OrderAckHandler {
    exec_count: AtomicU32,
}

impl RecvHandler for OrderAckHandler {
    fn on_message(&self, session: &SessionRef, msg: Arc<MsgBuf>) {
        println!("[{}] received: {:?}", session.target_comp_id(), msg);
        if field(&msg[..], 35).as_deref() != Some("D") {
            return;
        }
        let n = self.exec_count.fetch_add(1, Ordering::SeqCst) + 1;
        let cl_ord_id = field(&msg[..], 11).unwrap_or_default();
        let qty = field(&msg[..], 38).unwrap_or_else(|| String::from("0"));
        let builder = MessageBuilder::new(
            &session.handle().begin_string(),
            MsgType::EXECUTION_REPORT.into(),
        )
        .push(Tags::OrderID, SerializedInt::from(n).as_bytes())
        .push(Tags::ClOrdID, cl_ord_id.as_bytes())
        .push(Tags::ExecID, format!("x-{}", n).as_bytes())
        .push(Tags::ExecType, ExecType::NEW.into())
        .push(Tags::OrdStatus, OrdStatus::NEW.into())
        .push(Tags::Symbol, field(&msg[..], 55).unwrap_or_default().as_bytes())
        .push(Tags::Side, field(&msg[..], 54).unwrap_or_default().as_bytes())
        .push(Tags::LeavesQty, qty.as_bytes())
        .push(Tags::CumQty, qty.as_bytes())
        .push(Tags::AvgPx, b"0.0000");
        let _ = session.send_message(builder);
    }
}

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    let opts = Opts::parse();

    if opts.listen {
        let settings = EngineSettings::builder()
            .with_engine_id(&opts.sender_comp_id)
            .with_socket_addr(opts.addr)
            .with_store_dir(opts.store.clone())
            .with_log_dir(opts.log.clone())
            .with_heartbeat_timeout(opts.heartbeat)
            .build()?;
        let engine = FixEngine::bind(
            settings,
            Arc::new(OrderAckHandler {
                exec_count: AtomicU32::new(0),
            }),
        )?;
        println!("listening on port {}", engine.port());

        tokio::signal::ctrl_c().await?;
        println!("shutting down");
        engine.shutdown().await?;
    } else {
        let mut builder = SessionSettings::builder()
            .with_sender_comp_id(&opts.sender_comp_id)
            .with_target_comp_id(&opts.target_comp_id)
            .with_socket_addr(opts.addr)
            .with_store_path(opts.store.clone())
            .with_log_dir(opts.log.clone())
            .with_heartbeat_timeout(opts.heartbeat);
        if let Some(username) = &opts.username {
            builder = builder.with_username(username);
        }
        if let Some(password) = &opts.password {
            builder = builder.with_password(password);
        }
        let settings = builder.build()?;

        let (handler, mut events) = ChannelHandler::channel();
        let client = FixInitiator::build(settings, handler)?
            .connect(Duration::from_secs(5))
            .await?;
        println!("logged on to {}", client.target_comp_id());

        tokio::spawn(async move {
            while let Some(msg) = events.recv().await {
                println!("got an application message: {:?}", msg);
            }
        });

        for cl_ord_id in ["order-123", "order-124"] {
            send_order(&client, cl_ord_id, "IBM", 250).await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client.end_async().await?;
    }

    Ok(())
}

async fn send_order(
    client: &anvilfix::FixClient,
    cl_ord_id: &str,
    symbol: &str,
    qty: u32,
) -> Result<(), ApplicationError> {
    let builder = MessageBuilder::new(&client.begin_string(), MsgType::ORDER_SINGLE.into())
        .push(Tags::ClOrdID, cl_ord_id.as_bytes())
        .push(Tags::HandlInst, b"1")
        .push(Tags::Symbol, symbol.as_bytes())
        .push(Tags::Side, fields::Side::BUY.into())
        .push(Tags::TransactTime, formatted_time().as_bytes())
        .push(Tags::OrderQty, SerializedInt::from(qty).as_bytes())
        .push(Tags::OrdType, fields::OrdType::MARKET.into());

    client.send_message_async(builder).await
}
