//! Telemetry packet model.
//!
//! Wire field names are the firmware's short JSON keys and must not change;
//! the struct field names spell them out for the rest of the codebase.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The compact payload reported on `/packet/essentials`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssentialsPacket {
    #[serde(rename = "spd")]
    pub speed: f32,
    #[serde(rename = "temps")]
    pub battery_temperatures: [f32; 5],
    #[serde(rename = "v")]
    pub voltage: f32,
    #[serde(rename = "wh")]
    pub remaining_watt_hours: f32,
}

/// The full payload reported on `/packet/full`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullPacket {
    #[serde(rename = "v")]
    pub battery_voltages: [f32; 27],
    #[serde(rename = "temps")]
    pub battery_temperatures: [f32; 5],
    #[serde(rename = "mah")]
    pub spent_milliamp_hours: f32,
    #[serde(rename = "mwh")]
    pub spent_milliwatt_hours: f32,
    #[serde(rename = "amps")]
    pub current: f32,
    #[serde(rename = "soc")]
    pub percent_soc: f32,

    #[serde(rename = "hc")]
    pub hydro_current: f32,
    #[serde(rename = "hd")]
    pub hydro_ppm: f32,
    #[serde(rename = "ht")]
    pub hydro_temperature: f32,

    #[serde(rename = "ts")]
    pub temperature_smps: f32,
    #[serde(rename = "ted")]
    pub temperature_engine_driver: f32,
    #[serde(rename = "vced")]
    pub vc_engine_driver: [f32; 2],
    #[serde(rename = "vct")]
    pub vc_telemetry: [f32; 2],
    #[serde(rename = "vcs")]
    pub vc_smps: [f32; 2],
    #[serde(rename = "vcb")]
    pub vc_bms: [f32; 2],

    #[serde(rename = "spd")]
    pub speed: f32,
    #[serde(rename = "rpm")]
    pub rpm: f32,
    #[serde(rename = "vce")]
    pub vc_engine: [f32; 2],

    #[serde(rename = "long")]
    pub longitude: f32,
    #[serde(rename = "lat")]
    pub latitude: f32,
    #[serde(rename = "gyro")]
    pub gyro: [f32; 3],

    #[serde(rename = "q")]
    pub queue_fill_amount: u32,
    #[serde(rename = "tc")]
    pub tick_counter: u32,
    #[serde(rename = "heap")]
    pub free_heap: u32,
    #[serde(rename = "alloc")]
    pub alloc_count: u32,
    #[serde(rename = "free")]
    pub free_count: u32,
    #[serde(rename = "cu")]
    pub cpu_usage: f32,
}

/// Per-packet header fields, common to both payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Monotonic within a session; may skip on packet loss but never
    /// decreases.
    #[serde(rename = "seq")]
    pub sequence_id: u32,

    /// Seconds since epoch on the vehicle-local clock.
    #[serde(rename = "ts")]
    pub timestamp: i32,

    /// The session generator output at `sequence_id`.
    #[serde(rename = "rng")]
    pub rng_state: u32,
}

/// Payload variants. The variant is chosen by the endpoint that accepted
/// the batch, never by a tag inside the JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InnerPacket {
    Essentials(EssentialsPacket),
    Full(FullPacket),
}

/// One authenticated, typed telemetry datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub header: PacketHeader,
    pub inner: InnerPacket,
}

/// Payload types an endpoint can expect a batch to carry.
pub trait InnerVariant: DeserializeOwned {
    fn into_inner(self) -> InnerPacket;
}

impl InnerVariant for EssentialsPacket {
    fn into_inner(self) -> InnerPacket {
        InnerPacket::Essentials(self)
    }
}

impl InnerVariant for FullPacket {
    fn into_inner(self) -> InnerPacket {
        InnerPacket::Full(self)
    }
}
