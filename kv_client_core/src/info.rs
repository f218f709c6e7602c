//! Info protocol
//!
//! Requests are newline separated command names framed with the info
//! message type. Responses contain one `name\tvalue` line per command.

use crate::error::{ClientError, Result};
use crate::net::proto::{ProtoMessage, INFO_MESSAGE_TYPE};
use crate::net::{AsyncConnection, Connection};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

/// Encode an info request for the given command names
pub fn encode_request(names: &[&str]) -> Bytes {
    let mut body = BytesMut::new();
    for name in names {
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(b"\n");
    }
    ProtoMessage::new(INFO_MESSAGE_TYPE, body.freeze()).to_bytes()
}

/// Parse an info response body into a name/value map
pub fn parse_response(body: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(body)
        .map_err(|e| ClientError::Parse(format!("info response is not UTF-8: {}", e)))?;

    let mut map = HashMap::new();
    for line in text.split('\n').filter(|l| !l.is_empty()) {
        match line.split_once('\t') {
            Some((name, value)) => map.insert(name.to_string(), value.to_string()),
            None => map.insert(line.to_string(), String::new()),
        };
    }
    Ok(map)
}

fn check_response(message: &ProtoMessage) -> Result<()> {
    if message.header.msg_type != INFO_MESSAGE_TYPE {
        return Err(ClientError::Parse(format!(
            "expected info message, received type {}",
            message.header.msg_type
        )));
    }
    Ok(())
}

/// Send info commands over a blocking connection
pub fn request(conn: &mut dyn Connection, names: &[&str]) -> Result<HashMap<String, String>> {
    conn.write_all(&encode_request(names))?;
    let message = conn.read_message()?;
    check_response(&message)?;
    parse_response(&message.body)
}

/// Send one info command and return its value
pub fn request_value(conn: &mut dyn Connection, name: &str) -> Result<String> {
    let mut map = request(conn, &[name])?;
    take_value(&mut map, name)
}

/// Send info commands over an async connection
pub async fn request_async(
    conn: &mut dyn AsyncConnection,
    names: &[&str],
) -> Result<HashMap<String, String>> {
    conn.write_all(&encode_request(names)).await?;
    let message = conn.read_message().await?;
    check_response(&message)?;
    parse_response(&message.body)
}

/// Remove a required value from a response map
pub fn take_value(map: &mut HashMap<String, String>, name: &str) -> Result<String> {
    map.remove(name)
        .ok_or_else(|| ClientError::Parse(format!("info response is missing {}", name)))
}

/// Parse a required integer value such as a generation counter
pub fn parse_generation(map: &HashMap<String, String>, name: &str) -> Result<i64> {
    let value = map
        .get(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ClientError::Parse(format!("{} is empty", name)))?;
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::Parse(format!("{} is not a number: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let bytes = encode_request(&["node", "features"]);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], INFO_MESSAGE_TYPE);
        assert_eq!(&bytes[8..], b"node\nfeatures\n");
    }

    #[test]
    fn test_parse_response_lines() {
        let map = parse_response(b"node\tBB9\npartition-generation\t12\nlonely\n").unwrap();
        assert_eq!(map["node"], "BB9");
        assert_eq!(parse_generation(&map, "partition-generation").unwrap(), 12);
        assert_eq!(map["lonely"], "");
    }

    #[test]
    fn test_generation_errors() {
        let map = parse_response(b"peers-generation\t\nrebalance-generation\tx\n").unwrap();
        assert!(parse_generation(&map, "peers-generation").is_err());
        assert!(parse_generation(&map, "rebalance-generation").is_err());
        assert!(parse_generation(&map, "missing").is_err());
    }
}
