//! Session authentication
//!
//! Nodes obtain a session token with a full login on their tend connection
//! and use the cheaper authenticate call on every new pooled connection.

use crate::error::{ClientError, Result};
use crate::net::proto::{ProtoMessage, ADMIN_MESSAGE_TYPE};
use crate::net::{AsyncConnection, Connection};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};

const AUTHENTICATE: u8 = 0;
const LOGIN: u8 = 20;

const FIELD_USER: u8 = 0;
const FIELD_CLEAR_PASSWORD: u8 = 4;
const FIELD_SESSION_TOKEN: u8 = 5;
const FIELD_SESSION_TTL: u8 = 6;

const ADMIN_HEADER_SIZE: usize = 16;
const RESULT_OK: u8 = 0;
const SECURITY_NOT_ENABLED: u8 = 52;

/// Session token issued by a login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: Bytes,
    /// Time after which the token must be renewed
    pub expiration: Option<Instant>,
}

impl Session {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiration.map_or(false, |expiration| now >= expiration)
    }
}

/// Login and authenticate calls used by nodes
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Full login, returns the new session
    fn login(&self, conn: &mut dyn Connection, user: &str, password: &str) -> Result<Session>;

    /// Authenticate a connection with an existing session
    ///
    /// Returns `false` when the server rejected the token.
    fn authenticate(&self, conn: &mut dyn Connection, user: &str, session: &Session) -> Result<bool>;

    async fn authenticate_async(
        &self,
        conn: &mut dyn AsyncConnection,
        user: &str,
        session: &Session,
    ) -> Result<bool>;
}

/// Authenticator speaking the admin message protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct AdminAuthenticator;

impl AdminAuthenticator {
    fn login_request(user: &str, password: &str) -> Bytes {
        encode_admin(LOGIN, &[(FIELD_USER, user.as_bytes()), (FIELD_CLEAR_PASSWORD, password.as_bytes())])
    }

    fn authenticate_request(user: &str, session: &Session) -> Bytes {
        encode_admin(
            AUTHENTICATE,
            &[(FIELD_USER, user.as_bytes()), (FIELD_SESSION_TOKEN, &session.token[..])],
        )
    }
}

#[async_trait]
impl Authenticator for AdminAuthenticator {
    fn login(&self, conn: &mut dyn Connection, user: &str, password: &str) -> Result<Session> {
        conn.write_all(&Self::login_request(user, password))?;
        let message = conn.read_message()?;
        parse_login(&message)
    }

    fn authenticate(&self, conn: &mut dyn Connection, user: &str, session: &Session) -> Result<bool> {
        conn.write_all(&Self::authenticate_request(user, session))?;
        let message = conn.read_message()?;
        Ok(admin_result(&message)? == RESULT_OK)
    }

    async fn authenticate_async(
        &self,
        conn: &mut dyn AsyncConnection,
        user: &str,
        session: &Session,
    ) -> Result<bool> {
        conn.write_all(&Self::authenticate_request(user, session)).await?;
        let message = conn.read_message().await?;
        Ok(admin_result(&message)? == RESULT_OK)
    }
}

fn encode_admin(command: u8, fields: &[(u8, &[u8])]) -> Bytes {
    let mut body = BytesMut::with_capacity(ADMIN_HEADER_SIZE + 64);
    body.put_u8(0);
    body.put_u8(0);
    body.put_u8(command);
    body.put_u8(fields.len() as u8);
    body.put_bytes(0, ADMIN_HEADER_SIZE - 4);
    for (id, data) in fields {
        body.put_u32(data.len() as u32 + 1);
        body.put_u8(*id);
        body.put_slice(data);
    }
    ProtoMessage::new(ADMIN_MESSAGE_TYPE, body.freeze()).to_bytes()
}

fn admin_result(message: &ProtoMessage) -> Result<u8> {
    if message.body.len() < ADMIN_HEADER_SIZE {
        return Err(ClientError::Parse("admin response too short".to_string()));
    }
    Ok(message.body[1])
}

fn parse_login(message: &ProtoMessage) -> Result<Session> {
    let result = admin_result(message)?;
    if result == SECURITY_NOT_ENABLED {
        return Ok(Session {
            token: Bytes::new(),
            expiration: None,
        });
    }
    if result != RESULT_OK {
        return Err(ClientError::Authentication(format!("login failed with result {}", result)));
    }

    let field_count = message.body[3];
    let mut body = message.body.slice(ADMIN_HEADER_SIZE..);
    let mut token = None;
    let mut ttl_secs = None;

    for _ in 0..field_count {
        if body.remaining() < 5 {
            return Err(ClientError::Parse("truncated login field".to_string()));
        }
        let len = body.get_u32() as usize;
        let id = body.get_u8();
        let data_len = len.saturating_sub(1);
        if body.remaining() < data_len {
            return Err(ClientError::Parse("truncated login field".to_string()));
        }
        let data = body.split_to(data_len);
        match id {
            FIELD_SESSION_TOKEN => token = Some(data),
            FIELD_SESSION_TTL if data.len() == 4 => {
                ttl_secs = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            _ => {}
        }
    }

    let token = token.ok_or_else(|| ClientError::Authentication("login returned no session token".to_string()))?;
    // Renew a minute before the server drops the session.
    let expiration = ttl_secs
        .filter(|ttl| *ttl > 0)
        .map(|ttl| Instant::now() + Duration::from_secs(u64::from(ttl.saturating_sub(60).max(1))));

    Ok(Session { token, expiration })
}
