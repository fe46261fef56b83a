//! The command dispatcher: one loop, one frame at a time.
//!
//! The dispatcher exists in two states. `bootstrap` runs the session
//! handshake (Awaiting-Bootstrap); only a successfully bootstrapped value
//! can `serve` (Serving), so a frame can never be processed without an
//! established session. In the serving loop, transport failures on a frame
//! are logged and the frame is skipped — the host must never see a dead
//! sidecar because a single frame was corrupt — while malformed commands
//! are answered in-band.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{self, SecureChannel};
use crate::commands::{CommandHandler, Reply, Request, Response};
use crate::error::ProtocolError;

pub struct Dispatcher<H> {
    channel: SecureChannel,
    handler: H,
}

impl<H: CommandHandler> Dispatcher<H> {
    /// Performs the session handshake and returns a serving dispatcher.
    pub fn bootstrap<R: BufRead, W: Write>(
        reader: &mut R,
        writer: &mut W,
        handler: H,
    ) -> Result<Self> {
        let channel =
            channel::establish(reader, writer).context("failed to establish secure channel")?;
        Ok(Self::new(channel, handler))
    }

    fn new(channel: SecureChannel, handler: H) -> Self {
        Self { channel, handler }
    }

    /// Reads frames until EOF, answering each in request order.
    pub fn serve<R: BufRead, W: Write>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> std::io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                info!("input stream closed; shutting down");
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() {
                info!("blank input line; shutting down");
                return Ok(());
            }

            let plaintext = match self.channel.open_line(line) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    // Rattling the door is not fatal; skip the frame.
                    warn!("dropping undecryptable frame: {e}");
                    continue;
                }
            };

            let reply = match parse_request(&plaintext) {
                Ok(request) => {
                    debug!(command = %request.command, "dispatching");
                    self.route(&request)
                }
                Err(e) => Reply::Single(Response::err(e.to_string())),
            };
            self.emit(writer, reply)?;
        }
    }

    fn route(&mut self, request: &Request) -> Reply {
        let parameters: &Value = &request.parameters;
        match request.command.as_str() {
            "CONVERT_TO_TTL" => self.handler.convert_to_ttl(parameters),
            "OPEN_TTL" => self.handler.open_ttl(parameters),
            "BATCH_CONVERT" => self.handler.batch_convert(parameters),
            "GET_CONFIG" => self.handler.get_config(parameters),
            "SET_CONFIG" => self.handler.set_config(parameters),
            other => Reply::Single(Response::err(format!("Unknown command: {other}"))),
        }
    }

    /// Emits one reply: a single frame, or a metadata/payload frame pair
    /// with nothing interleaved between them.
    fn emit<W: Write>(&mut self, writer: &mut W, reply: Reply) -> std::io::Result<()> {
        match reply {
            Reply::Single(response) => {
                self.emit_frame(writer, &encode_response(&response))?;
            }
            Reply::Stream { meta, payload } => {
                self.emit_frame(writer, &encode_response(&meta))?;
                self.emit_frame(writer, &payload)?;
            }
        }
        Ok(())
    }

    fn emit_frame<W: Write>(&mut self, writer: &mut W, plaintext: &[u8]) -> std::io::Result<()> {
        match self.channel.seal_line(plaintext) {
            Ok(line) => {
                writeln!(writer, "{line}")?;
                writer.flush()
            }
            Err(e) => {
                // No authenticated way to report this; drop the response.
                warn!("failed to seal response frame: {e}");
                Ok(())
            }
        }
    }
}

/// Splits the inbound plaintext: a 32-bit big-endian length, then exactly
/// that many bytes of JSON. Trailing bytes are reserved and ignored.
fn parse_request(plaintext: &[u8]) -> std::result::Result<Request, ProtocolError> {
    if plaintext.len() < 4 {
        return Err(ProtocolError::TruncatedEnvelope);
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&plaintext[..4]);
    let len = u32::from_be_bytes(len) as usize;
    let body = plaintext
        .get(4..4 + len)
        .ok_or(ProtocolError::TruncatedEnvelope)?;
    Ok(serde_json::from_slice(body)?)
}

fn encode_response(response: &Response) -> Vec<u8> {
    // Response serialization cannot fail: plain fields and Value only.
    serde_json::to_vec(response).unwrap_or_else(|e| {
        warn!("failed to encode response envelope: {e}");
        br#"{"success":false,"error":"internal encoding error","result":null}"#.to_vec()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SESSION_KEY_LEN;
    use serde_json::json;
    use std::io::Cursor;

    /// Answers every command with an envelope naming it; `OPEN_TTL`
    /// streams instead.
    struct EchoHandler;

    impl CommandHandler for EchoHandler {
        fn convert_to_ttl(&mut self, parameters: &Value) -> Reply {
            Response::ok(json!({ "echo": "CONVERT_TO_TTL", "params": parameters })).into()
        }
        fn open_ttl(&mut self, _parameters: &Value) -> Reply {
            Reply::Stream {
                meta: Response::ok(json!({ "stream": true, "length": 4 })),
                payload: b"\x89PNG".to_vec(),
            }
        }
        fn batch_convert(&mut self, _parameters: &Value) -> Reply {
            Response::ok(json!("BATCH_CONVERT")).into()
        }
        fn get_config(&mut self, _parameters: &Value) -> Reply {
            Response::ok(json!("GET_CONFIG")).into()
        }
        fn set_config(&mut self, _parameters: &Value) -> Reply {
            Response::ok(json!("SET_CONFIG")).into()
        }
    }

    const SESSION_KEY: [u8; SESSION_KEY_LEN] = [0x6B; SESSION_KEY_LEN];

    fn host_channel() -> SecureChannel {
        SecureChannel::new(&SESSION_KEY).unwrap()
    }

    fn dispatcher() -> Dispatcher<EchoHandler> {
        Dispatcher::new(SecureChannel::new(&SESSION_KEY).unwrap(), EchoHandler)
    }

    fn encode_request(host: &mut SecureChannel, command: &str) -> String {
        let json = serde_json::to_vec(&json!({ "command": command, "parameters": {} })).unwrap();
        let mut plaintext = (json.len() as u32).to_be_bytes().to_vec();
        plaintext.extend_from_slice(&json);
        host.seal_line(&plaintext).unwrap()
    }

    fn run(input: String) -> (Vec<String>, SecureChannel) {
        let mut dispatcher = dispatcher();
        let mut reader = Cursor::new(input.into_bytes());
        let mut outbound = Vec::new();
        dispatcher.serve(&mut reader, &mut outbound).unwrap();
        let lines = String::from_utf8(outbound)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        (lines, host_channel())
    }

    fn decode_response(host: &mut SecureChannel, line: &str) -> Response {
        serde_json::from_slice(&host.open_line(line).unwrap()).unwrap()
    }

    #[test]
    fn routes_commands_and_answers_in_order() {
        let mut host = host_channel();
        let input = format!(
            "{}\n{}\n",
            encode_request(&mut host, "GET_CONFIG"),
            encode_request(&mut host, "BATCH_CONVERT"),
        );
        let (lines, mut host) = run(input);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            decode_response(&mut host, &lines[0]).result.unwrap(),
            "GET_CONFIG"
        );
        assert_eq!(
            decode_response(&mut host, &lines[1]).result.unwrap(),
            "BATCH_CONVERT"
        );
    }

    #[test]
    fn unknown_commands_get_an_in_band_error() {
        let mut host = host_channel();
        let input = format!("{}\n", encode_request(&mut host, "SELF_DESTRUCT"));
        let (lines, mut host) = run(input);
        let response = decode_response(&mut host, &lines[0]);
        assert!(!response.success);
        assert_eq!(response.error.unwrap(), "Unknown command: SELF_DESTRUCT");
    }

    #[test]
    fn corrupt_frames_are_skipped_without_killing_the_loop() {
        let mut host = host_channel();
        let good_before = encode_request(&mut host, "GET_CONFIG");
        let mut corrupted = encode_request(&mut host, "GET_CONFIG").into_bytes();
        // Flip a character inside the base64 body.
        corrupted[10] = if corrupted[10] == b'A' { b'B' } else { b'A' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        let good_after = encode_request(&mut host, "SET_CONFIG");

        let input = format!("{good_before}\n{corrupted}\nnot-base64!!\n{good_after}\n");
        let (lines, mut host) = run(input);

        // Two answers: the corrupted and malformed lines produced none.
        assert_eq!(lines.len(), 2);
        assert_eq!(
            decode_response(&mut host, &lines[0]).result.unwrap(),
            "GET_CONFIG"
        );
        assert_eq!(
            decode_response(&mut host, &lines[1]).result.unwrap(),
            "SET_CONFIG"
        );
    }

    #[test]
    fn streaming_replies_emit_metadata_then_payload() {
        let mut host = host_channel();
        let input = format!("{}\n", encode_request(&mut host, "OPEN_TTL"));
        let (lines, mut host) = run(input);
        assert_eq!(lines.len(), 2);

        let meta = decode_response(&mut host, &lines[0]);
        assert_eq!(meta.result.unwrap()["stream"], true);
        assert_eq!(host.open_line(&lines[1]).unwrap(), b"\x89PNG");
    }

    #[test]
    fn malformed_envelopes_are_answered_in_band() {
        let mut host = host_channel();
        // Length prefix pointing past the end of the plaintext.
        let mut plaintext = 1000u32.to_be_bytes().to_vec();
        plaintext.extend_from_slice(b"{}");
        let short = host.seal_line(&plaintext).unwrap();

        // Valid prefix, invalid JSON.
        let mut plaintext = 3u32.to_be_bytes().to_vec();
        plaintext.extend_from_slice(b"nop");
        let bad_json = host.seal_line(&plaintext).unwrap();

        let input = format!("{short}\n{bad_json}\n");
        let (lines, mut host) = run(input);
        assert_eq!(lines.len(), 2);
        assert!(!decode_response(&mut host, &lines[0]).success);
        assert!(!decode_response(&mut host, &lines[1]).success);
    }

    #[test]
    fn trailing_plaintext_bytes_are_reserved_and_ignored() {
        let mut host = host_channel();
        let json = serde_json::to_vec(&json!({ "command": "GET_CONFIG" })).unwrap();
        let mut plaintext = (json.len() as u32).to_be_bytes().to_vec();
        plaintext.extend_from_slice(&json);
        plaintext.extend_from_slice(b"reserved for future use");
        let input = format!("{}\n", host.seal_line(&plaintext).unwrap());

        let (lines, mut host) = run(input);
        assert_eq!(
            decode_response(&mut host, &lines[0]).result.unwrap(),
            "GET_CONFIG"
        );
    }
}
