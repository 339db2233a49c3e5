//! Typed qtest API
//!
//! Thin wrapper over [`QtestClient`] whose public methods are 1:1 with
//! qtest verbs. Integer arguments go out in decimal; replies parse with
//! auto base (`0x`-prefixed hex or decimal). Response shapes are validated
//! here, so callers see [`Error::Protocol`] instead of surprise payloads.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};
use crate::qtest::{QtestClient, Tokens};

/// Guest memory byte order, as reported by the `endianness` verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

impl FromStr for Endianness {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "big" => Ok(Endianness::Big),
            "little" => Ok(Endianness::Little),
            other => Err(Error::Protocol(format!(
                "unknown endianness '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Big => f.write_str("big"),
            Endianness::Little => f.write_str("little"),
        }
    }
}

/// Type-safe qtest API wrapper.
///
/// Wrapping instead of extending the protocol client keeps every public
/// method here a valid protocol command.
pub struct Qtest {
    client: QtestClient,
}

impl Qtest {
    pub fn new(client: QtestClient) -> Self {
        Qtest { client }
    }

    /// The underlying protocol client, for connection management.
    pub fn client(&self) -> &QtestClient {
        &self.client
    }

    async fn out_op(&self, cmd: &str, addr: u64, value: u64) -> Result<()> {
        let reply = self
            .client
            .execute(cmd, &[&addr.to_string(), &value.to_string()])
            .await?;
        expect_empty(reply)
    }

    async fn in_op(&self, cmd: &str, addr: u64) -> Result<u64> {
        let reply = self.client.execute(cmd, &[&addr.to_string()]).await?;
        parse_u64(&expect_single(reply)?)
    }

    pub async fn outb(&self, addr: u64, value: u8) -> Result<()> {
        self.out_op("outb", addr, value as u64).await
    }

    pub async fn outw(&self, addr: u64, value: u16) -> Result<()> {
        self.out_op("outw", addr, value as u64).await
    }

    pub async fn outl(&self, addr: u64, value: u32) -> Result<()> {
        self.out_op("outl", addr, value as u64).await
    }

    pub async fn inb(&self, addr: u64) -> Result<u8> {
        Ok(self.in_op("inb", addr).await? as u8)
    }

    pub async fn inw(&self, addr: u64) -> Result<u16> {
        Ok(self.in_op("inw", addr).await? as u16)
    }

    pub async fn inl(&self, addr: u64) -> Result<u32> {
        Ok(self.in_op("inl", addr).await? as u32)
    }

    pub async fn writeb(&self, addr: u64, value: u8) -> Result<()> {
        self.out_op("writeb", addr, value as u64).await
    }

    pub async fn writew(&self, addr: u64, value: u16) -> Result<()> {
        self.out_op("writew", addr, value as u64).await
    }

    pub async fn writel(&self, addr: u64, value: u32) -> Result<()> {
        self.out_op("writel", addr, value as u64).await
    }

    pub async fn writeq(&self, addr: u64, value: u64) -> Result<()> {
        self.out_op("writeq", addr, value).await
    }

    pub async fn readb(&self, addr: u64) -> Result<u8> {
        Ok(self.in_op("readb", addr).await? as u8)
    }

    pub async fn readw(&self, addr: u64) -> Result<u16> {
        Ok(self.in_op("readw", addr).await? as u16)
    }

    pub async fn readl(&self, addr: u64) -> Result<u32> {
        Ok(self.in_op("readl", addr).await? as u32)
    }

    pub async fn readq(&self, addr: u64) -> Result<u64> {
        self.in_op("readq", addr).await
    }

    /// Read guest memory; the reply is a `0x`-prefixed hex blob.
    pub async fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let reply = self
            .client
            .execute("read", &[&addr.to_string(), &size.to_string()])
            .await?;
        let blob = expect_single(reply)?;
        let hex_digits = blob
            .strip_prefix("0x")
            .ok_or_else(|| Error::Protocol(format!("expected 0x-prefixed data, got '{}'", blob)))?;
        hex::decode(hex_digits).map_err(|err| Error::Protocol(format!("bad hex data: {}", err)))
    }

    /// Read guest memory with base64 transfer, keeping log lines small.
    pub async fn b64read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let reply = self
            .client
            .execute("b64read", &[&addr.to_string(), &size.to_string()])
            .await?;
        let blob = expect_single(reply)?;
        BASE64
            .decode(blob.as_bytes())
            .map_err(|err| Error::Protocol(format!("bad base64 data: {}", err)))
    }

    /// Write guest memory: `write ADDR SIZE DATA`.
    pub async fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let blob = format!("0x{}", hex::encode(data));
        let reply = self
            .client
            .execute(
                "write",
                &[&addr.to_string(), &data.len().to_string(), &blob],
            )
            .await?;
        expect_empty(reply)
    }

    /// Write guest memory with base64 transfer: `b64write ADDR SIZE DATA`.
    pub async fn b64write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let blob = BASE64.encode(data);
        let reply = self
            .client
            .execute(
                "b64write",
                &[&addr.to_string(), &data.len().to_string(), &blob],
            )
            .await?;
        expect_empty(reply)
    }

    /// Fill guest memory: `memset ADDR SIZE VALUE`.
    pub async fn memset(&self, addr: u64, size: usize, value: u8) -> Result<()> {
        let reply = self
            .client
            .execute(
                "memset",
                &[&addr.to_string(), &size.to_string(), &value.to_string()],
            )
            .await?;
        expect_empty(reply)
    }

    /// Guest byte order.
    pub async fn endianness(&self) -> Result<Endianness> {
        let reply = self.client.execute("endianness", &[]).await?;
        expect_single(reply)?.parse()
    }

    /// Call an RTAS function.
    ///
    /// `nargs` arguments are read from `args_addr`; `nret` return values
    /// are written to `ret_addr`.
    pub async fn rtas(
        &self,
        cmd: &str,
        nargs: u32,
        args_addr: u64,
        nret: u32,
        ret_addr: u64,
    ) -> Result<()> {
        let reply = self
            .client
            .execute(
                "rtas",
                &[
                    cmd,
                    &nargs.to_string(),
                    &args_addr.to_string(),
                    &nret.to_string(),
                    &ret_addr.to_string(),
                ],
            )
            .await?;
        let rc = parse_i64(&expect_single(reply)?)?;
        if rc == -4 {
            return Err(Error::Qtest {
                status: "rtas".to_string(),
                reason: format!("H_PARAMETER ({})", rc),
            });
        }
        if rc != 0 {
            return Err(Error::Qtest {
                status: "rtas".to_string(),
                reason: format!("non-zero return code {}", rc),
            });
        }
        Ok(())
    }

    /// Step the virtual clock, by `ns` if given; returns the new clock.
    pub async fn clock_step(&self, ns: Option<u64>) -> Result<u64> {
        let reply = match ns {
            Some(ns) => {
                self.client
                    .execute("clock_step", &[&ns.to_string()])
                    .await?
            }
            None => self.client.execute("clock_step", &[]).await?,
        };
        parse_u64(&expect_single(reply)?)
    }

    /// Set the virtual clock; returns the new clock.
    pub async fn clock_set(&self, ns: u64) -> Result<u64> {
        let reply = self.client.execute("clock_set", &[&ns.to_string()]).await?;
        parse_u64(&expect_single(reply)?)
    }

    /// Load a module by prefix and library name.
    pub async fn module_load(&self, prefix: &str, libname: &str) -> Result<()> {
        let reply = self.client.execute("module_load", &[prefix, libname]).await?;
        expect_empty(reply)
    }

    /// Intercept inbound IRQs of the device at `qom_path`.
    pub async fn irq_intercept_in(&self, qom_path: &str) -> Result<()> {
        let reply = self.client.execute("irq_intercept_in", &[qom_path]).await?;
        expect_empty(reply)
    }

    /// Intercept outbound IRQs of the device at `qom_path`.
    pub async fn irq_intercept_out(&self, qom_path: &str) -> Result<()> {
        let reply = self.client.execute("irq_intercept_out", &[qom_path]).await?;
        expect_empty(reply)
    }

    /// Drive an input IRQ line of the device at `qom_path`.
    pub async fn set_irq_in(&self, qom_path: &str, name: &str, num: u32, level: u32) -> Result<()> {
        let reply = self
            .client
            .execute(
                "set_irq_in",
                &[qom_path, name, &num.to_string(), &level.to_string()],
            )
            .await?;
        expect_empty(reply)
    }
}

fn expect_empty(reply: Tokens) -> Result<()> {
    if reply.is_empty() {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "unexpected response payload: {}",
            reply.join(" ")
        )))
    }
}

fn expect_single(mut reply: Tokens) -> Result<String> {
    if reply.len() != 1 {
        return Err(Error::Protocol(format!(
            "expected one response token, got {}",
            reply.len()
        )));
    }
    Ok(reply.remove(0))
}

/// Parse an unsigned integer, `0x`-prefixed hex or decimal.
fn parse_u64(token: &str) -> Result<u64> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => token.parse(),
    };
    parsed.map_err(|err| Error::Protocol(format!("bad integer '{}': {}", token, err)))
}

/// Parse a signed integer, `0x`-prefixed hex or decimal.
fn parse_i64(token: &str) -> Result<i64> {
    let (sign, magnitude) = match token.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, token),
    };
    let parsed = match magnitude
        .strip_prefix("0x")
        .or_else(|| magnitude.strip_prefix("0X"))
    {
        Some(digits) => i64::from_str_radix(digits, 16),
        None => magnitude.parse(),
    };
    parsed
        .map(|value| sign * value)
        .map_err(|err| Error::Protocol(format!("bad integer '{}': {}", token, err)))
}
