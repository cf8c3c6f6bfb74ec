//! Pairing code codec.
//!
//! The desktop server shows a QR code carrying Wi-Fi credentials plus its own
//! address in the common `WIFI:` format, extended with an `I` (host) key and
//! an optional `O` (port) key:
//!
//! ```text
//! WIFI:T:WPA;S:LabPort;P:gemma3n8080;I:192.168.137.1;;
//! ```
//!
//! Parsing is pure: no I/O, and either a complete [`PairingPayload`] or an
//! [`AssistError::InvalidPayload`].

use std::collections::HashMap;
use std::fmt;

use crate::error::{AssistError, Result};
use crate::models::Endpoint;

pub const SCHEME_PREFIX: &str = "WIFI:";

/// Port the desktop server listens on unless the code says otherwise.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

const KEY_SSID: char = 'S';
const KEY_PASSPHRASE: char = 'P';
const KEY_HOST: char = 'I';
const KEY_PORT: char = 'O';
const KEY_AUTH: char = 'T';

#[derive(Clone, PartialEq, Eq)]
pub struct PairingPayload {
    pub ssid: String,
    pub passphrase: String,
    pub host: String,
    pub port: u16,
}

// Keeps the passphrase out of logs.
impl fmt::Debug for PairingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingPayload")
            .field("ssid", &self.ssid)
            .field("passphrase", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl PairingPayload {
    /// Parses a scanned code, using [`DEFAULT_SERVER_PORT`] when no port is given.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_default_port(text, DEFAULT_SERVER_PORT)
    }

    pub fn parse_with_default_port(text: &str, default_port: u16) -> Result<Self> {
        let trimmed = text.trim();
        let body = strip_scheme(trimmed)
            .ok_or_else(|| invalid(format!("code must start with '{}'", SCHEME_PREFIX)))?;

        let mut fields: HashMap<char, String> = HashMap::new();
        for (key, value) in split_fields(body)? {
            let mut chars = key.chars();
            let key_char = match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err(invalid(format!("field key '{}' must be a single character", key))),
            };
            if fields.insert(key_char, value).is_some() {
                return Err(invalid(format!("field '{}' appears more than once", key_char)));
            }
        }

        let ssid = required(&mut fields, KEY_SSID, "network name")?;
        let passphrase = required(&mut fields, KEY_PASSPHRASE, "password")?;
        let host = required(&mut fields, KEY_HOST, "server address")?;
        if host.chars().any(char::is_whitespace) || host.contains('/') {
            return Err(invalid(format!("server address '{}' is not a host", host)));
        }

        let port = match fields.remove(&KEY_PORT) {
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => return Err(invalid(format!("port '{}' is not valid", raw))),
            },
            None => default_port,
        };

        Ok(Self { ssid, passphrase, host, port })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Renders the canonical code text. The port is omitted when it is the default.
    pub fn to_code(&self) -> String {
        let mut code = format!(
            "{}{}:WPA;{}:{};{}:{};{}:{};",
            SCHEME_PREFIX,
            KEY_AUTH,
            KEY_SSID,
            escape(&self.ssid),
            KEY_PASSPHRASE,
            escape(&self.passphrase),
            KEY_HOST,
            escape(&self.host),
        );
        if self.port != DEFAULT_SERVER_PORT {
            code.push_str(&format!("{}:{};", KEY_PORT, self.port));
        }
        code.push(';');
        code
    }
}

fn invalid(reason: impl Into<String>) -> AssistError {
    AssistError::InvalidPayload(reason.into())
}

fn strip_scheme(text: &str) -> Option<&str> {
    let prefix = text.get(..SCHEME_PREFIX.len())?;
    if prefix.eq_ignore_ascii_case(SCHEME_PREFIX) {
        text.get(SCHEME_PREFIX.len()..)
    } else {
        None
    }
}

fn required(fields: &mut HashMap<char, String>, key: char, label: &str) -> Result<String> {
    match fields.remove(&key) {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(invalid(format!("{} ({}) is empty", label, key))),
        None => Err(invalid(format!("{} ({}) is missing", label, key))),
    }
}

/// Splits `K:V;K:V;;` into key/value pairs, honouring backslash escapes.
/// An empty field ends the payload; only whitespace may follow it.
fn split_fields(body: &str) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut terminated = false;
    let mut chars = body.chars();

    while let Some(c) = chars.next() {
        if terminated {
            if c.is_whitespace() {
                continue;
            }
            return Err(invalid("content after the end of the code"));
        }
        match c {
            '\\' => {
                let escaped = chars.next().ok_or_else(|| invalid("code ends with a dangling escape"))?;
                if in_value { value.push(escaped) } else { key.push(escaped) }
            }
            ':' if !in_value => {
                if key.is_empty() {
                    return Err(invalid("field without a key"));
                }
                in_value = true;
            }
            ';' => {
                if in_value {
                    fields.push((std::mem::take(&mut key), std::mem::take(&mut value)));
                    in_value = false;
                } else if key.is_empty() {
                    terminated = true;
                } else {
                    return Err(invalid(format!("field '{}' has no ':' separator", key)));
                }
            }
            other => {
                if in_value { value.push(other) } else { key.push(other) }
            }
        }
    }

    if in_value {
        fields.push((key, value));
    } else if !key.is_empty() {
        return Err(invalid(format!("field '{}' has no ':' separator", key)));
    }

    if fields.is_empty() {
        return Err(invalid("code carries no fields"));
    }
    Ok(fields)
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ';' | ':' | ',' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_shown_by_desktop_server() {
        let payload = PairingPayload::parse("WIFI:T:WPA;S:LabPort;P:gemma3n8080;I:192.168.137.1;;").unwrap();
        assert_eq!(payload.ssid, "LabPort");
        assert_eq!(payload.passphrase, "gemma3n8080");
        assert_eq!(payload.host, "192.168.137.1");
        assert_eq!(payload.port, DEFAULT_SERVER_PORT);
        assert_eq!(payload.endpoint().base_url(), "http://192.168.137.1:8000");
    }

    #[test]
    fn field_order_does_not_matter() {
        let codes = [
            "WIFI:S:Lab Net;P:pa55;I:10.42.0.1;T:WPA;;",
            "WIFI:I:10.42.0.1;T:WPA;P:pa55;S:Lab Net;;",
            "WIFI:P:pa55;S:Lab Net;I:10.42.0.1;;",
        ];
        for code in codes {
            let payload = PairingPayload::parse(code).unwrap();
            assert_eq!(payload.ssid, "Lab Net", "{}", code);
            assert_eq!(payload.passphrase, "pa55", "{}", code);
            assert_eq!(payload.host, "10.42.0.1", "{}", code);
        }
    }

    #[test]
    fn missing_required_key_is_rejected() {
        let codes = [
            "WIFI:T:WPA;P:pa55;I:10.42.0.1;;",
            "WIFI:T:WPA;S:Lab;I:10.42.0.1;;",
            "WIFI:T:WPA;S:Lab;P:pa55;;",
        ];
        for code in codes {
            let err = PairingPayload::parse(code).unwrap_err();
            assert!(matches!(err, AssistError::InvalidPayload(_)), "{}: {:?}", code, err);
        }
    }

    #[test]
    fn empty_values_are_rejected() {
        for code in [
            "WIFI:S:;P:pa55;I:10.42.0.1;;",
            "WIFI:S:Lab;P:;I:10.42.0.1;;",
            "WIFI:S:Lab;P:pa55;I:;;",
        ] {
            assert!(matches!(PairingPayload::parse(code), Err(AssistError::InvalidPayload(_))), "{}", code);
        }
    }

    #[test]
    fn malformed_structure_is_rejected() {
        for code in [
            "",
            "S:Lab;P:pa55;I:10.42.0.1;;",
            "MECARD:S:Lab;P:pa55;I:10.42.0.1;;",
            "WIFI:",
            "WIFI:S:Lab;P:pa55;;I:10.42.0.1;;",
            "WIFI:S:Lab;Ppa55;I:10.42.0.1;;",
            "WIFI:S:Lab;PH2:x;P:pa55;I:10.42.0.1;;",
            "WIFI:S:Lab;S:Other;P:pa55;I:10.42.0.1;;",
            "WIFI:S:Lab;P:pa55;I:10.42.0.1\\",
            "WIFI:S:Lab;P:pa55;I:10.42.0.1;O:notaport;;",
            "WIFI:S:Lab;P:pa55;I:10.42.0.1;O:0;;",
            "WIFI:S:Lab;P:pa55;I:http://10.42.0.1;;",
        ] {
            assert!(matches!(PairingPayload::parse(code), Err(AssistError::InvalidPayload(_))), "{}", code);
        }
    }

    #[test]
    fn optional_port_and_escapes() {
        let payload = PairingPayload::parse("wifi:S:My\\;Lab;P:a\\:b\\\\c;I:192.168.2.1;O:8080;;\n").unwrap();
        assert_eq!(payload.ssid, "My;Lab");
        assert_eq!(payload.passphrase, "a:b\\c");
        assert_eq!(payload.port, 8080);
    }

    #[test]
    fn unterminated_last_field_is_accepted() {
        let payload = PairingPayload::parse("WIFI:S:Lab;P:pa55;I:10.42.0.1").unwrap();
        assert_eq!(payload.host, "10.42.0.1");
    }

    #[test]
    fn rendered_code_parses_back_with_special_characters() {
        let payload = PairingPayload {
            ssid: "Lab;Port".into(),
            passphrase: "p:w\\d,\"x\"".into(),
            host: "10.42.0.1".into(),
            port: 9001,
        };
        assert_eq!(PairingPayload::parse(&payload.to_code()).unwrap(), payload);
    }

    #[test]
    fn debug_output_hides_passphrase() {
        let payload = PairingPayload::parse("WIFI:S:Lab;P:supersecret;I:10.42.0.1;;").unwrap();
        assert!(!format!("{:?}", payload).contains("supersecret"));
    }
}
