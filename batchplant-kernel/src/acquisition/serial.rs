//! Serial capability used by the acquisition units.
//!
//! Units only need "open this port" and `std::io::Read` with a short timeout;
//! tests plug scripted readers behind the same trait.

use crate::config::{Parity, SerialConf};
use std::io::{self, Read};

pub type SerialStream = Box<dyn Read + Send>;

pub trait SerialConnector: Send + Sync {
    fn open(&self, port: &str) -> io::Result<SerialStream>;
}

/// Real serial ports through the `serialport` crate.
pub struct SerialPortConnector {
    conf: SerialConf,
}

impl SerialPortConnector {
    pub fn new(conf: SerialConf) -> Self {
        Self { conf }
    }
}

impl SerialConnector for SerialPortConnector {
    fn open(&self, port: &str) -> io::Result<SerialStream> {
        let data_bits = match self.conf.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let parity = match self.conf.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stop_bits = if self.conf.stop_bits == 2 {
            serialport::StopBits::Two
        } else {
            serialport::StopBits::One
        };

        let stream = serialport::new(port, self.conf.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(self.conf.read_timeout())
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(stream))
    }
}
