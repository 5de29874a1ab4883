//! One chip-select window on the SPI bus

use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use super::proto::*;
use super::{Delay, Error};

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// How many bytes we clock out waiting for an R1 response.
const R1_POLL_LIMIT: usize = 512;

/// The card is selected for as long as this lives. Chip select is raised
/// again when it is dropped, whatever happened in between.
pub struct SpiSession<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
}

impl<'spi, 'cs, SPI, CS> Drop for SpiSession<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs.set_high().ok();
        // One more byte so the card lets go of MISO
        self.receive().ok();
    }
}

/// The six bytes of a command, CRC included.
pub fn command_frame(command: u8, arg: u32) -> [u8; 6] {
    let arg = arg.to_be_bytes();
    let mut frame = [0x40 | command, arg[0], arg[1], arg[2], arg[3], 0];
    frame[5] = crc7(&frame[0..5]);
    frame
}

impl<'spi, 'cs, SPI, CS> SpiSession<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS) -> Result<Self, Error> {
        cs.set_low().map_err(|_| Error::GpioError)?;
        Ok(Self { spi, cs })
    }

    /// Clock `buffer` out, replacing it with what came back.
    fn exchange(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.spi.transfer(buffer).map_err(|_e| Error::Transport)?;
        Ok(())
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        let mut byte = [0xFF];
        self.exchange(&mut byte)?;
        Ok(byte[0])
    }

    /// Fill `buffer` from the card.
    pub fn receive_into(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for b in buffer.iter_mut() {
            *b = 0xFF;
        }
        self.exchange(buffer)
    }

    /// Receive the four bytes trailing an R3 or R7 response.
    pub fn receive_u32(&mut self) -> Result<u32, Error> {
        let mut bytes = [0u8; 4];
        self.receive_into(&mut bytes)?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Send bytes, ignoring whatever the card sends back meanwhile.
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &b in bytes {
            self.exchange(&mut [b])?;
        }
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// timeout.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new();
        while self.receive()? != 0xFF {
            delay.delay(Error::TimeoutWaitNotBusy)?;
        }
        Ok(())
    }

    /// Perform a command, returning the R1 byte. A card that flags a CRC
    /// error on the command gets an `InvalidResponse`, as that usually means
    /// the bus is too fast for the wiring.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.wait_not_busy()?;
        trace!("CMD{} arg={:x}", command, arg);
        let mut frame = command_frame(command, arg);
        self.exchange(&mut frame)?;

        // The byte after a stop command is junk
        if command == CMD12 {
            self.receive()?;
        }

        for _ in 0..R1_POLL_LIMIT {
            let r1 = self.receive()?;
            if r1 & 0x80 != ERROR_OK {
                continue;
            }
            if r1 & R1_COM_CRC_ERROR != 0 {
                return Err(Error::InvalidResponse(r1));
            }
            return Ok(r1);
        }

        Err(Error::TimeoutCommand(command))
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.card_command(CMD55, 0)?;
        self.card_command(command, arg).map_err(|e| match e {
            Error::TimeoutCommand(c) => Error::TimeoutACommand(c),
            e => e,
        })
    }

    /// Read one data block (or a register) from the card and check its
    /// CRC. Always fills the given buffer, so make sure it's the right size.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut delay = Delay::new();
        let token = loop {
            let token = self.receive()?;
            if token != 0xFF {
                break token;
            }
            delay.delay(Error::TimeoutReadBuffer)?;
        };
        if token != DATA_START_BLOCK {
            return Err(Error::ReadError);
        }

        self.receive_into(buffer)?;
        let mut crc = [0u8; 2];
        self.receive_into(&mut crc)?;

        let received = u16::from_be_bytes(crc);
        let calculated = crc16(buffer);
        if received != calculated {
            return Err(Error::CrcError(received, calculated));
        }
        Ok(())
    }

    /// Write one data block behind `token` and check the card took it.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        self.send(&[token])?;
        self.send(buffer)?;
        self.send(&crc16(buffer).to_be_bytes())?;
        let status = self.receive()?;
        if status & DATA_RES_MASK != DATA_RES_ACCEPTED {
            return Err(Error::WriteError);
        }
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
