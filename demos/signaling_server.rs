use std::collections::HashMap;
use std::sync::Arc;

use actix::{Actor, AsyncContext, Handler, Message, StreamHandler};
use actix_web::web::{Data, Query};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use actix_web_actors::ws;
use tokio::sync::{mpsc, Mutex};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vcroom::config::ServerConfig;
use vcroom::registry::SharedWorker;
use vcroom::room::RoomOwner;
use vcroom::session::Session;
use vcroom::signaling::connection;
use vcroom::signaling::message::SendingMessage;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().expect("Failed to read configuration");

    let worker = Arc::new(SharedWorker::new(config.worker.clone()));
    worker.ensure().await.expect("Failed to create worker");
    let room_owner = RoomOwner::new(worker, config.media.clone(), config.transport.clone());
    let room_data = Data::new(Mutex::new(room_owner));

    let port = config.port;
    tracing::info!("Listening on port {}", port);

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(index)
            .app_data(room_data.clone())
            .route("/mediasoup", web::get().to(socket))
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

async fn socket(
    req: HttpRequest,
    room_owner: Data<Mutex<RoomOwner>>,
    stream: web::Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let parameters = Query::<HashMap<String, String>>::from_query(req.query_string())
        .map(|query| query.into_inner())
        .unwrap_or_default();
    let room_id = parameters
        .get("room")
        .cloned()
        .unwrap_or_else(|| "default".to_owned());

    // Rejects bad upgrades before the peer is added to a room.
    ws::handshake(&req)?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    // Joining under the owner lock keeps the room from being removed in between.
    let session = {
        let mut owner = room_owner.lock().await;
        let room = owner.get_or_create(&room_id);
        connection::join(&room, outbound_tx.clone()).await
    };
    tracing::info!("Joining room {}", room_id);
    let server = WebSocket::new(session, outbound_tx, outbound_rx, room_owner.clone());
    ws::start(server, &req, stream)
}

type Joined = (
    Session,
    mpsc::UnboundedSender<SendingMessage>,
    mpsc::UnboundedReceiver<SendingMessage>,
);

struct WebSocket {
    owner: Data<Mutex<RoomOwner>>,
    joined: Option<Joined>,
    inbound: Option<mpsc::UnboundedSender<String>>,
}

impl WebSocket {
    fn new(
        session: Session,
        outbound_tx: mpsc::UnboundedSender<SendingMessage>,
        outbound_rx: mpsc::UnboundedReceiver<SendingMessage>,
        owner: Data<Mutex<RoomOwner>>,
    ) -> Self {
        Self {
            owner,
            joined: Some((session, outbound_tx, outbound_rx)),
            inbound: None,
        }
    }
}

impl Actor for WebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("New WebSocket connection is started");
        let Some((session, outbound_tx, mut outbound_rx)) = self.joined.take() else {
            return;
        };
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.inbound = Some(inbound_tx);

        let address = ctx.address();
        actix::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                address.do_send(Outbound(message));
            }
        });

        let room_id = session.room().id.clone();
        let owner = self.owner.clone();
        actix::spawn(async move {
            let remaining = connection::run(session, inbound_rx, outbound_tx).await;
            if remaining == 0 {
                owner.lock().await.remove_if_empty(&room_id).await;
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("The WebSocket connection is stopped");
        // Ends the connection loop, which closes the session.
        self.inbound = None;
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocket {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => tracing::info!("pong received"),
            Ok(ws::Message::Text(text)) => {
                if let Some(inbound) = self.inbound.as_ref() {
                    if inbound.send(text.to_string()).is_err() {
                        tracing::error!("connection loop is gone");
                        ctx.close(None);
                    }
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                self.inbound = None;
            }
            Err(error) => tracing::error!("websocket protocol error: {}", error),
            _ => (),
        }
    }
}

struct Outbound(SendingMessage);

impl Message for Outbound {
    type Result = ();
}

impl Handler<Outbound> for WebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        tracing::debug!("sending message: {:?}", msg.0);
        match msg.0.encode() {
            Ok(text) => ctx.text(text),
            Err(error) => tracing::error!("failed to encode message: {}", error),
        }
    }
}
