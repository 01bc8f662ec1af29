//! Built-in message handlers.
//!
//! Every handler here is registered in the catalog under its name, so a
//! `[[routes]]` entry can list it in `handlers`.

use redweb_core::{
    CloseReason, Connection, DefaultHandler, Handler, HandlerCatalog, HandlerError, Registry,
    RegistryItem,
};
use redweb_protocol::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Build the catalog of handlers the server can attach to routes.
#[must_use]
pub fn catalog() -> HandlerCatalog {
    let mut catalog = HandlerCatalog::new();
    catalog
        .register(DefaultHandler::NAME, || DefaultHandler)
        .register("echo", || Echo)
        .register("ping", || Ping)
        .register("chat", || Chat)
        .register("room", Room::default);
    catalog
}

/// Replies with the message unchanged.
pub struct Echo;

impl Handler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_message(&self, conn: &Connection, message: &Envelope) -> Result<(), HandlerError> {
        conn.send_json(message)?;
        Ok(())
    }
}

/// Replies with `{"type":"pong"}`.
pub struct Ping;

impl Handler for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn on_message(&self, conn: &Connection, _message: &Envelope) -> Result<(), HandlerError> {
        conn.send_json(&json!({"type": "pong"}))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ChatIn {
    text: String,
}

#[derive(Debug, Serialize)]
struct ChatOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    from: String,
    text: &'a str,
}

/// Relays chat lines to every other connection on the route.
pub struct Chat;

impl Handler for Chat {
    fn name(&self) -> &str {
        "chat"
    }

    fn on_message(&self, conn: &Connection, message: &Envelope) -> Result<(), HandlerError> {
        let chat: ChatIn = message.parse()?;
        let delivered = conn.broadcast(&ChatOut {
            kind: "chat",
            from: conn.id().to_string(),
            text: &chat.text,
        })?;
        conn.send_json(&json!({"type": "chat_ack", "delivered": delivered}))?;
        Ok(())
    }
}

/// A connection adopted by [`Room`].
struct Member {
    id: String,
    room: String,
    conn: Connection,
}

impl RegistryItem for Member {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => Some(self.id.clone()),
            "room" => Some(self.room.clone()),
            _ => None,
        }
    }
}

/// Groups handshake-assigned connections into named rooms and relays every
/// raw frame to the sender's room.
///
/// Joined with `{"type":"__handlerConnect","data":{"handlerName":"room","room":"<name>"}}`.
#[derive(Default)]
pub struct Room {
    members: Arc<Registry<Member>>,
}

impl Handler for Room {
    fn name(&self) -> &str {
        "room"
    }

    fn on_adopt(&self, conn: &Connection, data: &Value) -> Result<(), HandlerError> {
        let room = data
            .get("room")
            .and_then(Value::as_str)
            .unwrap_or("lobby")
            .to_string();

        self.members.add(Member {
            id: conn.id().to_string(),
            room: room.clone(),
            conn: conn.clone(),
        });
        debug!(connection = %conn.id(), room = %room, "Joined room");

        conn.send_json(&json!({"type": "joined", "room": room}))?;
        Ok(())
    }

    fn on_frame(&self, conn: &Connection, frame: &[u8]) -> Result<(), HandlerError> {
        let id = conn.id().to_string();
        let Some(sender) = self.members.get(&id) else {
            return Err(HandlerError::msg("Not a room member"));
        };

        let text = String::from_utf8_lossy(frame);
        for member in self.members.all() {
            if member.room == sender.room && member.id != sender.id {
                let _ = member.conn.send_text(text.to_string());
            }
        }
        Ok(())
    }

    fn on_close(&self, conn: &Connection, _reason: CloseReason) {
        if self.members.remove_id(&conn.id().to_string()) {
            debug!(connection = %conn.id(), "Left room");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redweb_core::{DispatchPolicy, Outbound, Route, RouteConfig};
    use tokio::sync::mpsc;

    fn route(config: RouteConfig, names: &[&str]) -> Route {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let factories = catalog().resolve(&names).unwrap();
        Route::new(config, factories).unwrap()
    }

    fn connect(route: &Route, ip: &str) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = route.accept(format!("{ip}:4000").parse().unwrap(), tx);
        (conn, rx)
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("Expected text, got close"),
        }
    }

    #[test]
    fn test_catalog_names() {
        assert_eq!(
            catalog().names(),
            vec!["DefaultHandler", "chat", "echo", "ping", "room"]
        );
    }

    #[test]
    fn test_ping_replies_pong() {
        let route = route(RouteConfig::new("/"), &["ping"]);
        let (conn, mut rx) = connect(&route, "10.0.0.1");

        route.handle_frame(&conn, br#"{"type":"ping"}"#);
        assert_eq!(next_json(&mut rx), json!({"type": "pong"}));
    }

    #[test]
    fn test_chat_relays_and_acks() {
        let route = route(RouteConfig::new("/chat"), &["chat"]);
        let (alice, mut alice_rx) = connect(&route, "10.0.0.1");
        let (_bob, mut bob_rx) = connect(&route, "10.0.0.2");

        route.handle_frame(&alice, br#"{"type":"chat","text":"hello"}"#);

        assert_eq!(
            next_json(&mut bob_rx),
            json!({"type": "chat", "from": alice.id().to_string(), "text": "hello"})
        );
        assert_eq!(
            next_json(&mut alice_rx),
            json!({"type": "chat_ack", "delivered": 1})
        );
    }

    #[test]
    fn test_chat_without_text_is_fault() {
        let route = route(RouteConfig::new("/chat"), &["chat"]);
        let (alice, mut alice_rx) = connect(&route, "10.0.0.1");

        route.handle_frame(&alice, br#"{"type":"chat"}"#);

        let reply = next_json(&mut alice_rx);
        assert!(reply["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid payload"));
        assert!(alice.is_closed());
    }

    #[test]
    fn test_room_relays_within_room() {
        let config = RouteConfig::new("/game").dispatch(DispatchPolicy::HandlerAssignment);
        let route = route(config, &["room"]);
        let (a, mut a_rx) = connect(&route, "10.0.0.1");
        let (b, mut b_rx) = connect(&route, "10.0.0.2");
        let (c, mut c_rx) = connect(&route, "10.0.0.3");

        let join = |conn: &Connection, room: &str| {
            let frame = format!(
                r#"{{"type":"__handlerConnect","data":{{"handlerName":"room","room":"{room}"}}}}"#
            );
            route.handle_frame(conn, frame.as_bytes());
        };
        join(&a, "red");
        join(&b, "red");
        join(&c, "blue");
        assert_eq!(next_json(&mut a_rx), json!({"type": "joined", "room": "red"}));
        next_json(&mut b_rx);
        next_json(&mut c_rx);

        route.handle_frame(&a, b"move e4");

        assert_eq!(
            b_rx.try_recv().unwrap(),
            Outbound::Text("move e4".to_string())
        );
        assert!(c_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn test_room_forgets_closed_members() {
        let room = Room::default();
        let members = Arc::clone(&room.members);
        let route = Route::builder(
            RouteConfig::new("/game").dispatch(DispatchPolicy::HandlerAssignment),
        )
        .handler(move || Room {
            members: Arc::clone(&members),
        })
        .build()
        .unwrap();
        let join = br#"{"type":"__handlerConnect","data":{"handlerName":"room","room":"red"}}"#;

        for _ in 0..5 {
            let (conn, _rx) = connect(&route, "10.0.0.1");
            route.handle_frame(&conn, join);
            assert_eq!(room.members.count(), 1);
            route.disconnect(&conn, CloseReason::ClientClosed);
        }
        assert_eq!(route.client_count(), 0);
        assert_eq!(room.members.count(), 0);

        let (stay, _stay_rx) = connect(&route, "10.0.0.2");
        route.handle_frame(&stay, join);
        let (first, _first_rx) = connect(&route, "10.0.0.3");
        route.handle_frame(&first, join);
        let (_second, _second_rx) = connect(&route, "10.0.0.3");

        assert!(first.is_closed());
        assert_eq!(room.members.count(), 1);
        assert!(room.members.get(&stay.id().to_string()).is_some());
    }
}
