//! # sdmmc-storage
//!
//! > SD/MMC card storage for Embedded Rust
//!
//! This crate brings up an SD or MMC card, either over SPI or over a native
//! 1-bit/4-bit SD/MMC host, mounts the FAT16 or FAT32 volume on it, and
//! serves it through one `Storage` trait. On top of that sit deferred file
//! actions for automations, an HTTP file server handler, and sensors that
//! publish capacity and bus clock figures. It is `#![no_std]` and uses
//! `alloc` for paths, listings and response bodies.
//!
//! ## Using the crate
//!
//! The configuration is checked first. Only a validated `BusConfig` can be
//! used to set up a card, so pin mistakes are caught before any hardware is
//! touched.
//!
//! ```rust,ignore
//! let config = sdmmc_storage::CardConfig {
//!     bus_type: sdmmc_storage::config::BusType::SdSpi,
//!     cs_pin: Some(5),
//!     ..Default::default()
//! };
//! let bus = config.validate(sdmmc_storage::config::Variant::Esp32C6)?;
//! let spi_card = sdmmc_storage::SdMmcSpi::new(spi, cs);
//! let mut card = sdmmc_storage::SdCard::setup_spi(spi_card, Some(power_pin), bus);
//! card.dump_config();
//!
//! let server = sdmmc_storage::FileServer::new(sdmmc_storage::FileServerConfig {
//!     enable_download: true,
//!     ..Default::default()
//! })?;
//! if server.can_handle(request.path()) {
//!     let response = server.handle(&mut card, &request);
//!     // hand `response` to the web server
//! }
//! ```
//!
//! A card that fails to come up doesn't stop anything else: the facade
//! reports `StorageError::Unavailable` and the sensors publish NaN.
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//! * `refcell-blockdevice`: `BlockDevice` for `RefCell<T>` and `&RefCell<T>`.
//! * `refcell-storage`: `Storage` for `&RefCell<T>`, so the file server and the
//! actions can share one card.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]
// #![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

extern crate alloc;

#[macro_use]
mod structure;

pub mod block_device;
pub mod mbr;
pub mod sdmmc;

pub mod fat;
pub mod path;
pub mod storage;

pub mod action;
pub mod card;
pub mod config;
pub mod file_server;

pub use crate::action::{ActionData, ActionKind, ActionRegistry, DataValue, FileAction, Templatable};
pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::card::{
    InitError, NoPowerControl, SdCard, Sensor, SensorBinding, SensorKind, TextSensor,
};
pub use crate::config::{BusConfig, CardConfig, ConfigError, FileServerConfig};
pub use crate::fat::{FatVolume, TimeSource, Timestamp};
pub use crate::file_server::{Body, Download, FileServer, Method, Request, Response};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{CardDevice, CardType, SdMmcNative, SdMmcSpi};
pub use crate::storage::{FileInfo, Storage, StorageError, WriteMode};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
