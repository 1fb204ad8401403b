//! Hashing and symmetric encryption helpers.
//!
//! # Usage in Lua
//!
//! ```lua
//! local digest = crypto.sha256(body)
//! local sig = crypto.hmac_sha256(secret, body)
//! local token = crypto.encrypt(card_number)
//! local card = crypto.decrypt(token)
//! local id = crypto.uuid()
//! ```
//!
//! `encrypt`/`decrypt` use the host's configured
//! [`Encryptor`](crate::services::Encryptor) and fail without one. The
//! rest are pure.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use mlua::{Lua, String as LuaString, Table};
use sha2::{Digest, Sha256};

use super::{host_error, require_service};
use crate::lua::host::HostApi;

type HmacSha256 = Hmac<Sha256>;

/// Build the `crypto` table.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub(crate) fn register(lua: &Lua, api: &Arc<HostApi>) -> Result<Table> {
    let crypto = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create crypto table: {e}"))?;

    // crypto.sha256(s) -> hex
    let sha256_fn = lua
        .create_function(|_, data: LuaString| Ok(hex::encode(Sha256::digest(&*data.as_bytes()))))
        .map_err(|e| anyhow!("Failed to create crypto.sha256 function: {e}"))?;
    crypto
        .set("sha256", sha256_fn)
        .map_err(|e| anyhow!("Failed to set crypto.sha256: {e}"))?;

    // crypto.hmac_sha256(key, s) -> hex
    let hmac_fn = lua
        .create_function(|_, (key, data): (LuaString, LuaString)| {
            let mut mac = HmacSha256::new_from_slice(&key.as_bytes())
                .map_err(|e| mlua::Error::runtime(format!("crypto.hmac_sha256: {e}")))?;
            mac.update(&data.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })
        .map_err(|e| anyhow!("Failed to create crypto.hmac_sha256 function: {e}"))?;
    crypto
        .set("hmac_sha256", hmac_fn)
        .map_err(|e| anyhow!("Failed to set crypto.hmac_sha256: {e}"))?;

    // crypto.encrypt(plaintext) -> ciphertext
    let host = Arc::clone(api);
    let encrypt_fn = lua
        .create_function(move |_, plaintext: String| {
            let encryptor = require_service(host.services.encryptor(), "encryptor")?;
            encryptor
                .encrypt(&plaintext)
                .map_err(host_error("crypto.encrypt"))
        })
        .map_err(|e| anyhow!("Failed to create crypto.encrypt function: {e}"))?;
    crypto
        .set("encrypt", encrypt_fn)
        .map_err(|e| anyhow!("Failed to set crypto.encrypt: {e}"))?;

    // crypto.decrypt(ciphertext) -> plaintext
    let host = Arc::clone(api);
    let decrypt_fn = lua
        .create_function(move |_, ciphertext: String| {
            let encryptor = require_service(host.services.encryptor(), "encryptor")?;
            encryptor
                .decrypt(&ciphertext)
                .map_err(host_error("crypto.decrypt"))
        })
        .map_err(|e| anyhow!("Failed to create crypto.decrypt function: {e}"))?;
    crypto
        .set("decrypt", decrypt_fn)
        .map_err(|e| anyhow!("Failed to set crypto.decrypt: {e}"))?;

    // crypto.uuid() -> string
    let uuid_fn = lua
        .create_function(|_, ()| Ok(uuid::Uuid::new_v4().to_string()))
        .map_err(|e| anyhow!("Failed to create crypto.uuid function: {e}"))?;
    crypto
        .set("uuid", uuid_fn)
        .map_err(|e| anyhow!("Failed to set crypto.uuid: {e}"))?;

    // crypto.base64_encode(bytes) -> string
    let b64_encode_fn = lua
        .create_function(|_, data: LuaString| Ok(BASE64.encode(&*data.as_bytes())))
        .map_err(|e| anyhow!("Failed to create crypto.base64_encode function: {e}"))?;
    crypto
        .set("base64_encode", b64_encode_fn)
        .map_err(|e| anyhow!("Failed to set crypto.base64_encode: {e}"))?;

    // crypto.base64_decode(string) -> bytes
    let b64_decode_fn = lua
        .create_function(|lua, encoded: String| {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| mlua::Error::runtime(format!("crypto.base64_decode: {e}")))?;
            lua.create_string(bytes)
        })
        .map_err(|e| anyhow!("Failed to create crypto.base64_decode function: {e}"))?;
    crypto
        .set("base64_decode", b64_decode_fn)
        .map_err(|e| anyhow!("Failed to set crypto.base64_decode: {e}"))?;

    Ok(crypto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmEncryptor;

    fn setup(with_encryptor: bool) -> (tokio::runtime::Runtime, Lua) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let api = HostApi::for_tests(rt.handle().clone());
        if with_encryptor {
            api.services.set_encryptor(Arc::new(AesGcmEncryptor::new([7u8; 32])));
        }
        let lua = Lua::new();
        let table = register(&lua, &api).expect("Should register crypto");
        lua.globals().set("crypto", table).unwrap();
        (rt, lua)
    }

    #[test]
    fn test_sha256_known_vector() {
        let (_rt, lua) = setup(false);
        let digest: String = lua.load(r#"return crypto.sha256("abc")"#).eval().unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        let (_rt, lua) = setup(false);
        let mac: String = lua
            .load(r#"return crypto.hmac_sha256("key", "The quick brown fox jumps over the lazy dog")"#)
            .eval()
            .unwrap();
        assert_eq!(
            mac,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (_rt, lua) = setup(true);
        let ok: bool = lua
            .load(
                r#"
                local token = crypto.encrypt("4242 4242")
                return token ~= "4242 4242" and crypto.decrypt(token) == "4242 4242"
            "#,
            )
            .eval()
            .unwrap();
        assert!(ok);
    }

    #[test]
    fn test_encrypt_without_encryptor_fails() {
        let (_rt, lua) = setup(false);
        let err = lua.load(r#"crypto.encrypt("x")"#).exec().unwrap_err();
        assert!(err.to_string().contains("encryptor is not configured"));
    }

    #[test]
    fn test_uuid_and_base64() {
        let (_rt, lua) = setup(false);
        let (id, roundtrip): (String, String) = lua
            .load(r#"return crypto.uuid(), crypto.base64_decode(crypto.base64_encode("hi\0there"))"#)
            .eval()
            .unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_eq!(roundtrip, "hi\0there");
    }
}
