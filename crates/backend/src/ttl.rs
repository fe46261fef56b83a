//! The TTL container manager: seals image payloads into expiring
//! envelopes and opens them back, keyed through the HKDF hierarchy.
//!
//! Container layout: `magic(8) ‖ expiry(8 BE secs) ‖ salt(16) ‖ nonce(12)
//! ‖ ciphertext ‖ tag(16)`. The header through the salt is covered as AAD,
//! so a tampered expiry fails the open. The payload itself is opaque
//! bytes; rendering pixels or thumbnails is the host's concern.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::commands::{CommandHandler, Reply, Response};
use crate::config::AppConfig;
use gcm::AesGcm;
use keys::{MasterKey, SALT_LEN};

const MAGIC: &[u8; 8] = b"TTLIMG01";
const HEADER_LEN: usize = 8 + 8 + SALT_LEN;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Payloads at or above this size go back as a streaming pair instead of
/// base64 inside the JSON envelope.
const STREAM_THRESHOLD: usize = 64 * 1024;

pub struct TtlManager {
    master: MasterKey,
    config_path: PathBuf,
}

impl TtlManager {
    pub fn new(master: MasterKey, config_path: PathBuf) -> Self {
        Self {
            master,
            config_path,
        }
    }

    /// Seals `input_path` into a TTL container, returning the output path.
    fn create_container(
        &self,
        input_path: &Path,
        expiry_ts: u64,
        output_path: Option<&Path>,
    ) -> Result<PathBuf> {
        let payload = std::fs::read(input_path)
            .with_context(|| format!("failed to read {}", input_path.display()))?;

        let salt = keys::generate_salt();
        let cek = self.master.derive_cek(&salt);
        let mut engine = AesGcm::new(&cek).context("failed to build container cipher")?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(MAGIC);
        header[8..16].copy_from_slice(&expiry_ts.to_be_bytes());
        header[16..].copy_from_slice(&salt);

        let sealed = engine
            .encrypt(&nonce, &payload, &header, TAG_LEN)
            .context("failed to seal container")?;

        let out = match output_path {
            Some(path) => path.to_path_buf(),
            None => input_path.with_extension("ttl"),
        };
        let mut file = Vec::with_capacity(HEADER_LEN + NONCE_LEN + sealed.len());
        file.extend_from_slice(&header);
        file.extend_from_slice(&nonce);
        file.extend_from_slice(&sealed);
        std::fs::write(&out, &file)
            .with_context(|| format!("failed to write {}", out.display()))?;

        info!(input = %input_path.display(), output = %out.display(), expiry_ts, "created TTL container");
        Ok(out)
    }

    /// Opens a TTL container, enforcing its expiry, and returns the payload.
    fn open_container(&self, path: &Path) -> Result<Vec<u8>> {
        let file = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if file.len() < HEADER_LEN + NONCE_LEN + TAG_LEN || &file[..8] != MAGIC {
            bail!("{} is not a TTL container", path.display());
        }

        let header = &file[..HEADER_LEN];
        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&header[8..16]);
        let expiry_ts = u64::from_be_bytes(expiry);
        if now_ts()? > expiry_ts {
            bail!("TTL container has expired");
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&header[16..]);
        let cek = self.master.derive_cek(&salt);
        let mut engine = AesGcm::new(&cek).context("failed to build container cipher")?;

        let nonce = &file[HEADER_LEN..HEADER_LEN + NONCE_LEN];
        let body = &file[HEADER_LEN + NONCE_LEN..];
        let payload = engine.decrypt(nonce, body, header, TAG_LEN).map_err(|_| {
            // Do not echo cipher internals to the host.
            anyhow::anyhow!("container is corrupt or was sealed under a different master key")
        })?;

        debug!(path = %path.display(), len = payload.len(), "opened TTL container");
        Ok(payload)
    }

    fn default_expiry(&self) -> Result<u64> {
        let config = AppConfig::load(&self.config_path)
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
        Ok(now_ts()? + (config.default_ttl_hours * 3600.0) as u64)
    }

    fn convert_one(&self, parameters: &Value, input_path: &str) -> Result<PathBuf> {
        let input = Path::new(input_path);
        if !input.is_file() {
            bail!("input_path missing or file not found");
        }
        let expiry_ts = match parameters.get("expiry_ts").and_then(Value::as_u64) {
            Some(ts) => ts,
            None => self.default_expiry()?,
        };
        let output = parameters
            .get("output_path")
            .and_then(Value::as_str)
            .map(Path::new);
        self.create_container(input, expiry_ts, output)
    }
}

impl CommandHandler for TtlManager {
    fn convert_to_ttl(&mut self, parameters: &Value) -> Reply {
        let Some(input_path) = parameters.get("input_path").and_then(Value::as_str) else {
            return Response::err("input_path missing or file not found").into();
        };
        match self.convert_one(parameters, input_path) {
            Ok(path) => Response::ok(json!(path.display().to_string())).into(),
            Err(e) => Response::err(e.to_string()).into(),
        }
    }

    fn open_ttl(&mut self, parameters: &Value) -> Reply {
        let Some(input_path) = parameters.get("input_path").and_then(Value::as_str) else {
            return Response::err("input_path missing or file not found").into();
        };
        let thumbnail_mode = parameters
            .get("thumbnail_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let payload = match self.open_container(Path::new(input_path)) {
            Ok(payload) => payload,
            Err(e) => return Response::err(e.to_string()).into(),
        };

        // Thumbnails stay small enough for the JSON envelope; full images
        // above the threshold go back as a metadata/payload frame pair.
        if !thumbnail_mode && payload.len() >= STREAM_THRESHOLD {
            let meta = Response::ok(json!({ "stream": true, "length": payload.len() }));
            Reply::Stream { meta, payload }
        } else {
            Response::ok(json!(BASE64.encode(&payload))).into()
        }
    }

    fn batch_convert(&mut self, parameters: &Value) -> Reply {
        let Some(paths) = parameters.get("input_paths").and_then(Value::as_array) else {
            return Response::err("input_paths missing or not a list").into();
        };

        let mut results = Vec::with_capacity(paths.len());
        let mut converted = 0usize;
        for entry in paths {
            let Some(input_path) = entry.as_str() else {
                results.push(json!({ "input": entry, "success": false, "error": "not a path" }));
                continue;
            };
            match self.convert_one(parameters, input_path) {
                Ok(path) => {
                    converted += 1;
                    results.push(json!({
                        "input": input_path,
                        "success": true,
                        "output": path.display().to_string(),
                    }));
                }
                Err(e) => results.push(json!({
                    "input": input_path,
                    "success": false,
                    "error": e.to_string(),
                })),
            }
        }

        Response::ok(json!({
            "converted": converted,
            "failed": results.len() - converted,
            "results": results,
        }))
        .into()
    }

    fn get_config(&mut self, _parameters: &Value) -> Reply {
        match AppConfig::load(&self.config_path) {
            Ok(config) => match serde_json::to_value(&config) {
                Ok(value) => Response::ok(value).into(),
                Err(e) => Response::err(e.to_string()).into(),
            },
            Err(e) => Response::err(e.to_string()).into(),
        }
    }

    fn set_config(&mut self, parameters: &Value) -> Reply {
        let Some(config_value) = parameters.get("config") else {
            return Response::err("No config data provided").into();
        };
        let config: AppConfig = match serde_json::from_value(config_value.clone()) {
            Ok(config) => config,
            Err(e) => return Response::err(format!("invalid config: {e}")).into(),
        };
        match config.save(&self.config_path) {
            Ok(()) => Response::ok(json!("Configuration saved")).into(),
            Err(e) => Response::err(e.to_string()).into(),
        }
    }
}

fn now_ts() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the epoch")?
        .as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ttl-test-{}-{name}", std::process::id()))
    }

    fn manager() -> TtlManager {
        TtlManager::new(
            MasterKey::from_bytes([0x33; keys::KEY_LEN]),
            scratch("config.json"),
        )
    }

    fn expect_single(reply: Reply) -> Response {
        match reply {
            Reply::Single(response) => response,
            Reply::Stream { .. } => panic!("expected a single-frame reply"),
        }
    }

    #[test]
    fn create_then_open_round_trips_the_payload() {
        let input = scratch("image.png");
        std::fs::write(&input, b"not really a png").unwrap();

        let mut manager = manager();
        let params = json!({
            "input_path": input.display().to_string(),
            "expiry_ts": now_ts().unwrap() + 3600,
        });
        let response = expect_single(manager.convert_to_ttl(&params));
        assert!(response.success, "{:?}", response.error);
        let ttl_path = response.result.unwrap().as_str().unwrap().to_string();

        let response = expect_single(manager.open_ttl(&json!({ "input_path": ttl_path })));
        assert!(response.success, "{:?}", response.error);
        let payload = BASE64
            .decode(response.result.unwrap().as_str().unwrap())
            .unwrap();
        assert_eq!(payload, b"not really a png");

        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&ttl_path).unwrap();
    }

    #[test]
    fn large_payloads_stream() {
        let input = scratch("large.png");
        std::fs::write(&input, vec![0xA5u8; STREAM_THRESHOLD]).unwrap();

        let mut manager = manager();
        let params = json!({
            "input_path": input.display().to_string(),
            "expiry_ts": now_ts().unwrap() + 3600,
        });
        let ttl_path = expect_single(manager.convert_to_ttl(&params))
            .result
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();

        match manager.open_ttl(&json!({ "input_path": ttl_path })) {
            Reply::Stream { meta, payload } => {
                assert!(meta.success);
                assert_eq!(meta.result.unwrap()["length"], STREAM_THRESHOLD);
                assert_eq!(payload.len(), STREAM_THRESHOLD);
            }
            Reply::Single(_) => panic!("expected a streaming reply"),
        }

        // Thumbnail requests keep the single-frame shape regardless of size.
        let reply = manager.open_ttl(&json!({
            "input_path": ttl_path,
            "thumbnail_mode": true,
        }));
        assert!(expect_single(reply).success);

        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&ttl_path).unwrap();
    }

    #[test]
    fn expired_containers_refuse_to_open() {
        let input = scratch("expired.png");
        std::fs::write(&input, b"stale").unwrap();

        let mut manager = manager();
        let params = json!({
            "input_path": input.display().to_string(),
            "expiry_ts": now_ts().unwrap() - 1,
        });
        let ttl_path = expect_single(manager.convert_to_ttl(&params))
            .result
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();

        let response = expect_single(manager.open_ttl(&json!({ "input_path": ttl_path })));
        assert!(!response.success);
        assert!(response.error.unwrap().contains("expired"));

        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&ttl_path).unwrap();
    }

    #[test]
    fn tampered_expiry_fails_authentication() {
        let input = scratch("tamper.png");
        std::fs::write(&input, b"payload").unwrap();

        let mut manager = manager();
        let params = json!({
            "input_path": input.display().to_string(),
            "expiry_ts": now_ts().unwrap() + 10,
        });
        let ttl_path = expect_single(manager.convert_to_ttl(&params))
            .result
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();

        // Push the expiry far into the future behind the cipher's back.
        let mut file = std::fs::read(&ttl_path).unwrap();
        file[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        std::fs::write(&ttl_path, &file).unwrap();

        let response = expect_single(manager.open_ttl(&json!({ "input_path": ttl_path })));
        assert!(!response.success);

        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&ttl_path).unwrap();
    }

    #[test]
    fn different_master_keys_cannot_open_each_others_containers() {
        let input = scratch("foreign.png");
        std::fs::write(&input, b"payload").unwrap();

        let mut ours = manager();
        let params = json!({
            "input_path": input.display().to_string(),
            "expiry_ts": now_ts().unwrap() + 3600,
        });
        let ttl_path = expect_single(ours.convert_to_ttl(&params))
            .result
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();

        let mut theirs = TtlManager::new(
            MasterKey::from_bytes([0x34; keys::KEY_LEN]),
            scratch("config.json"),
        );
        let response = expect_single(theirs.open_ttl(&json!({ "input_path": ttl_path })));
        assert!(!response.success);

        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&ttl_path).unwrap();
    }

    #[test]
    fn batch_convert_collects_per_file_outcomes() {
        let good = scratch("batch-good.png");
        std::fs::write(&good, b"ok").unwrap();

        let mut manager = manager();
        let params = json!({
            "input_paths": [good.display().to_string(), "/nonexistent/missing.png"],
            "expiry_ts": now_ts().unwrap() + 3600,
        });
        let response = expect_single(manager.batch_convert(&params));
        assert!(response.success);
        let result = response.result.unwrap();
        assert_eq!(result["converted"], 1);
        assert_eq!(result["failed"], 1);
        assert_eq!(result["results"][0]["success"], true);
        assert_eq!(result["results"][1]["success"], false);

        std::fs::remove_file(&good).unwrap();
        std::fs::remove_file(good.with_extension("ttl")).unwrap();
    }
}
