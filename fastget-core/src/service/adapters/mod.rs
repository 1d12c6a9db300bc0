//! One adapter per streaming service. Shared behavior (fan-out, DASH
//! mediainfo, auth flows) lives in the parent module; each file here only
//! carries its service's URL grammar, API payloads and license framing.

pub mod crackle;
pub mod ctv;
pub mod gem;
pub mod pluto;
pub mod roku;
pub mod stv;
pub mod tubi;
pub mod uktvplay;
