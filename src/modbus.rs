//! Modbus TCP client for Alfen EV charger communication
//!
//! This module provides async Modbus TCP communication with the Alfen EV
//! charger, handling both socket-slave (real-time measurement) and
//! station-slave (configuration) registers, with bounded-retry reconnection
//! that distinguishes transport failures (worth retrying) from protocol
//! failures (not worth retrying).

use crate::config::ModbusConfig;
use crate::error::{BridgeError, Result};
use crate::logging::get_logger;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

/// Modbus TCP client for Alfen communication
pub struct ModbusClient {
    /// Modbus TCP client connection
    client: Option<tokio_modbus::client::Context>,

    /// Configuration
    config: ModbusConfig,

    /// Connection timeout
    connection_timeout: Duration,

    /// Operation timeout
    operation_timeout: Duration,

    /// Logger
    logger: crate::logging::StructuredLogger,
}

impl ModbusClient {
    /// Create a new Modbus client
    pub fn new(config: &ModbusConfig) -> Self {
        let logger = get_logger("modbus");
        Self {
            client: None,
            config: config.clone(),
            connection_timeout: Duration::from_millis(config.connect_timeout_ms),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
            logger,
        }
    }

    /// Connect to the Modbus server
    pub async fn connect(&mut self) -> Result<()> {
        let address = format!("{}:{}", self.config.ip, self.config.port);

        self.logger
            .info(&format!("Connecting to Modbus server at {}", address));

        let socket_addr: std::net::SocketAddr = address
            .parse()
            .map_err(|e| BridgeError::modbus(format!("Invalid socket address: {}", e)))?;

        match timeout(self.connection_timeout, tcp::connect(socket_addr)).await {
            Ok(Ok(client)) => {
                self.client = Some(client);
                self.logger.info("Successfully connected to Modbus server");
                Ok(())
            }
            Ok(Err(e)) => {
                let error_msg = format!("connection failed: {}", e);
                self.logger.error(&error_msg);
                Err(BridgeError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "connection timeout".to_string();
                self.logger.error(&error_msg);
                Err(BridgeError::timeout(error_msg))
            }
        }
    }

    /// Disconnect from the Modbus server
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            self.logger.info("Disconnecting from Modbus server");
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Read holding registers
    pub async fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let timeout_duration = self.operation_timeout;

        self.logger.debug(&format!(
            "Reading {} registers from address {} on slave {}",
            count, address, slave_id
        ));

        let client = self.get_client()?;
        let request = client.read_holding_registers(address, count);

        match timeout(timeout_duration, request).await {
            Ok(Ok(Ok(response))) => {
                self.logger.trace(&format!(
                    "Read {} registers: {:?}",
                    response.len(),
                    response
                ));
                Ok(response)
            }
            Ok(Ok(Err(e))) => {
                let error_msg = format!("read holding registers failed: {}", e);
                self.logger.error(&error_msg);
                Err(BridgeError::modbus(error_msg))
            }
            Ok(Err(e)) => {
                let error_msg = format!("read holding registers failed: {}", e);
                self.logger.error(&error_msg);
                Err(BridgeError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "read operation timeout".to_string();
                self.logger.error(&error_msg);
                Err(BridgeError::timeout(error_msg))
            }
        }
    }

    /// Write single register
    pub async fn write_single_register(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<()> {
        let timeout_duration = self.operation_timeout;

        self.logger.debug(&format!(
            "Writing value {} to register {} on slave {}",
            value, address, slave_id
        ));

        let client = self.get_client()?;
        let request = client.write_single_register(address, value);

        match timeout(timeout_duration, request).await {
            Ok(Ok(_)) => {
                self.logger.debug("Successfully wrote single register");
                Ok(())
            }
            Ok(Err(e)) => {
                let error_msg = format!("write single register failed: {}", e);
                self.logger.error(&error_msg);
                Err(BridgeError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "write operation timeout".to_string();
                self.logger.error(&error_msg);
                Err(BridgeError::timeout(error_msg))
            }
        }
    }

    /// Write multiple registers
    pub async fn write_multiple_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let timeout_duration = self.operation_timeout;

        self.logger.debug(&format!(
            "Writing {} values to registers starting at {} on slave {}",
            values.len(),
            address,
            slave_id
        ));

        let client = self.get_client()?;
        let request = client.write_multiple_registers(address, values);

        match timeout(timeout_duration, request).await {
            Ok(Ok(_)) => {
                self.logger.debug("Successfully wrote multiple registers");
                Ok(())
            }
            Ok(Err(e)) => {
                let error_msg = format!("write multiple registers failed: {}", e);
                self.logger.error(&error_msg);
                Err(BridgeError::modbus(error_msg))
            }
            Err(_) => {
                let error_msg = "write operation timeout".to_string();
                self.logger.error(&error_msg);
                Err(BridgeError::timeout(error_msg))
            }
        }
    }

    /// Get client reference or error if not connected
    fn get_client(&mut self) -> Result<&mut tokio_modbus::client::Context> {
        self.client
            .as_mut()
            .ok_or_else(|| BridgeError::modbus("not connected to Modbus server"))
    }
}

/// Decode 32-bit float from two 16-bit registers (big-endian)
pub fn decode_32bit_float(registers: &[u16]) -> Result<f32> {
    if registers.len() < 2 {
        return Err(BridgeError::modbus(
            "Insufficient registers for 32-bit float",
        ));
    }

    let bytes = [
        (registers[0] >> 8) as u8,
        (registers[0] & 0xFF) as u8,
        (registers[1] >> 8) as u8,
        (registers[1] & 0xFF) as u8,
    ];

    Ok(f32::from_be_bytes(bytes))
}

/// Decode 64-bit float from four 16-bit registers (big-endian)
pub fn decode_64bit_float(registers: &[u16]) -> Result<f64> {
    if registers.len() < 4 {
        return Err(BridgeError::modbus(
            "Insufficient registers for 64-bit float",
        ));
    }

    let bytes = [
        (registers[0] >> 8) as u8,
        (registers[0] & 0xFF) as u8,
        (registers[1] >> 8) as u8,
        (registers[1] & 0xFF) as u8,
        (registers[2] >> 8) as u8,
        (registers[2] & 0xFF) as u8,
        (registers[3] >> 8) as u8,
        (registers[3] & 0xFF) as u8,
    ];

    Ok(f64::from_be_bytes(bytes))
}

/// Decode an ASCII string packed two characters per register
pub fn decode_string(registers: &[u16], max_length: Option<usize>) -> Result<String> {
    let mut bytes = Vec::with_capacity(registers.len() * 2);

    for &reg in registers {
        bytes.push((reg >> 8) as u8);
        bytes.push((reg & 0xFF) as u8);
    }

    let string = String::from_utf8(bytes)
        .map_err(|e| BridgeError::modbus(format!("Invalid UTF-8 string: {}", e)))?;

    let string = string.trim_matches('\0').trim();

    if let Some(max_len) = max_length {
        Ok(string.chars().take(max_len).collect())
    } else {
        Ok(string.to_string())
    }
}

/// Encode 32-bit float to two 16-bit registers (big-endian)
pub fn encode_32bit_float(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    [
        ((bytes[0] as u16) << 8) | (bytes[1] as u16),
        ((bytes[2] as u16) << 8) | (bytes[3] as u16),
    ]
}

/// Connection manager with bounded-retry, exponentially backed-off
/// reconnection. Only transport errors (`BridgeError::is_transport`) trigger
/// a reconnect cycle; protocol errors (illegal address, illegal value) are
/// returned immediately since retrying them cannot help.
pub struct ModbusConnectionManager {
    client: ModbusClient,
    max_retry_attempts: u32,
    backoff_initial: Duration,
    backoff_max: Duration,
    logger: crate::logging::StructuredLogger,
}

impl ModbusConnectionManager {
    /// Create a new connection manager from the Modbus configuration
    pub fn new(config: &ModbusConfig) -> Self {
        let logger = get_logger("modbus_manager");
        Self {
            client: ModbusClient::new(config),
            max_retry_attempts: config.max_retry_attempts.max(1),
            backoff_initial: Duration::from_millis(config.retry_backoff_initial_ms),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
            logger,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn connection_status(&self) -> Option<bool> {
        Some(self.client.is_connected())
    }

    /// Execute a Modbus operation, reconnecting and retrying with
    /// exponential backoff on transport errors. Gives up with
    /// `BridgeError::RetryExhausted` once `max_retry_attempts` is reached.
    pub async fn execute_with_reconnect<F, T>(
        &mut self,
        operation_name: &str,
        operation: F,
    ) -> Result<T>
    where
        F: for<'a> Fn(
            &'a mut ModbusClient,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>,
    {
        let mut attempts: u32 = 0;
        let mut backoff = self.backoff_initial;
        let mut last_cause = String::new();

        loop {
            if !self.client.is_connected()
                && let Err(e) = self.client.connect().await
            {
                last_cause = e.to_string();
                attempts += 1;
                if attempts >= self.max_retry_attempts {
                    return Err(BridgeError::retry_exhausted(
                        operation_name,
                        attempts,
                        &last_cause,
                    ));
                }
                self.logger
                    .warn(&format!("connect attempt {} failed: {}", attempts, last_cause));
                sleep(backoff).await;
                backoff = (backoff * 2).min(self.backoff_max);
                continue;
            }

            match operation(&mut self.client).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transport() => {
                    self.logger
                        .warn(&format!("{} failed (transport): {}", operation_name, e));
                    last_cause = e.to_string();
                    self.client.disconnect().await.ok();
                    attempts += 1;
                    if attempts >= self.max_retry_attempts {
                        return Err(BridgeError::retry_exhausted(
                            operation_name,
                            attempts,
                            &last_cause,
                        ));
                    }
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_max);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::driver::modbus_like::ModbusLike for ModbusConnectionManager {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn connection_status(&self) -> Option<bool> {
        Some(self.client.is_connected())
    }

    async fn read_holding_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.execute_with_reconnect("read_holding_registers", move |c| {
            Box::pin(async move { c.read_holding_registers(slave_id, address, count).await })
        })
        .await
    }

    async fn write_multiple_registers(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let values = values.to_vec();
        self.execute_with_reconnect("write_multiple_registers", move |c| {
            let values = values.clone();
            Box::pin(async move { c.write_multiple_registers(slave_id, address, &values).await })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModbusConfig;

    #[test]
    fn test_decode_32bit_float() {
        let registers = [0x3F80, 0x0000]; // 1.0 in big-endian
        let result = decode_32bit_float(&registers).unwrap();
        assert!((result - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decode_64bit_float() {
        let registers = [0x3FF0, 0x0000, 0x0000, 0x0000]; // 1.0 in big-endian
        let result = decode_64bit_float(&registers).unwrap();
        assert!((result - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_encode_32bit_float() {
        let value = 1.0f32;
        let registers = encode_32bit_float(value);
        assert_eq!(registers, [0x3F80, 0x0000]);
    }

    #[test]
    fn test_decode_string() {
        let registers = [0x0041, 0x0042, 0x0043]; // "ABC"
        let result = decode_string(&registers, None).unwrap();
        assert_eq!(result, "ABC");
    }

    #[test]
    fn test_modbus_config_defaults() {
        let config = ModbusConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.socket_slave_id, 1);
        assert_eq!(config.station_slave_id, 200);
        assert_eq!(config.max_retry_attempts, 3);
    }

    #[test]
    fn test_modbus_client_creation() {
        let config = ModbusConfig::default();
        let client = ModbusClient::new(&config);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn execute_with_reconnect_gives_up_after_max_attempts() {
        let mut config = ModbusConfig::default();
        config.ip = "198.51.100.1".to_string(); // TEST-NET-2, never connects
        config.connect_timeout_ms = 50;
        config.operation_timeout_ms = 50;
        config.max_retry_attempts = 2;
        config.retry_backoff_initial_ms = 1;
        config.retry_backoff_max_ms = 2;

        let mut manager = ModbusConnectionManager::new(&config);
        let result = manager
            .execute_with_reconnect("read_holding_registers", |c| {
                Box::pin(async move { c.read_holding_registers(1, 0, 2).await })
            })
            .await;

        assert!(matches!(result, Err(BridgeError::RetryExhausted { attempts: 2, .. })));
    }
}
