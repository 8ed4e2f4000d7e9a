//! Light adaptor over a [`Device`] session.
//! Translates brightness, color temperature, and HSV/RGB color into the DPS
//! bundles Tuya lamps expect, and tracks derived state from inbound reports.

use crate::device::{DPS_INDEX_ON, Device, PayloadHook, StopHook};
use crate::error::{Result, TuyaError};
use crate::protocol::CommandType;
use log::warn;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

/// DPS index of the operating mode.
pub const DPS_INDEX_MODE: &str = "2";
/// DPS index of the white-mode brightness.
pub const DPS_INDEX_BRIGHTNESS: &str = "3";
/// DPS index of the white color temperature.
pub const DPS_INDEX_COLORTEMP: &str = "4";
/// DPS index of the combined RGB+HSV color string.
pub const DPS_INDEX_COLOR: &str = "5";

const HUE_MAX: u16 = 360;

/// Operating modes reported through DPS '2'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightMode {
    Colour,
    White,
    Scene,
    Scene1,
    Scene2,
    Scene3,
    Scene4,
}

impl LightMode {
    /// The literal the device uses for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            LightMode::Colour => "colour",
            LightMode::White => "white",
            LightMode::Scene => "scene",
            LightMode::Scene1 => "scene_1",
            LightMode::Scene2 => "scene_2",
            LightMode::Scene3 => "scene_3",
            LightMode::Scene4 => "scene_4",
        }
    }

    /// Maps a device mode literal back to a known mode, if any.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "colour" => Some(LightMode::Colour),
            "white" => Some(LightMode::White),
            "scene" => Some(LightMode::Scene),
            "scene_1" => Some(LightMode::Scene1),
            "scene_2" => Some(LightMode::Scene2),
            "scene_3" => Some(LightMode::Scene3),
            "scene_4" => Some(LightMode::Scene4),
            _ => None,
        }
    }
}

impl std::fmt::Display for LightMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct LightState {
    mode: Option<LightMode>,
    brightness: Option<u8>,
    color_temp: Option<u8>,
    hue: Option<u16>,
    saturation: Option<u8>,
}

/// A combined mutation applied in a single CONTROL frame by
/// [`Light::set_multiple`].
#[derive(Debug, Default, Clone)]
pub struct LightUpdate {
    pub color_temp: Option<u8>,
    /// Hue in degrees (0-360) and saturation (0-255).
    pub hs_color: Option<(u16, u8)>,
    pub brightness: Option<u8>,
    pub enabled: Option<bool>,
}

/// A Tuya smart lamp: a [`Device`] session plus color handling.
pub struct Light {
    device: Device,
    state: Arc<RwLock<LightState>>,
}

impl Light {
    /// Attach light semantics to a device session.
    pub fn new(device: Device) -> Self {
        let state = Arc::new(RwLock::new(LightState::default()));

        let weak = Arc::downgrade(&state);
        let hook: PayloadHook = Arc::new(move |command, payload| {
            if let Some(state) = weak.upgrade() {
                apply_payload(&state, command, payload);
            }
        });
        device.set_payload_hook(hook);

        let weak = Arc::downgrade(&state);
        let stop_hook: StopHook = Arc::new(move || {
            if let Some(state) = weak.upgrade() {
                *state.write() = LightState::default();
            }
        });
        device.set_stop_hook(stop_hook);

        Self { device, state }
    }

    /// The wrapped device session.
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub async fn connect(&self) -> Result<()> {
        self.device.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.device.disconnect().await
    }

    pub async fn update(&self) -> Result<()> {
        self.device.update().await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.device.set_enabled(enabled).await
    }

    pub fn get_enabled(&self) -> Option<bool> {
        self.device.get_enabled()
    }

    /// The current operating mode, if known.
    pub fn get_mode(&self) -> Option<LightMode> {
        self.state.read().mode
    }

    /// The current brightness (white mode) or HSV value (colour mode).
    pub fn get_brightness(&self) -> Option<u8> {
        self.state.read().brightness
    }

    /// The current white color temperature.
    pub fn get_color_temp(&self) -> Option<u8> {
        self.state.read().color_temp
    }

    /// The current hue (degrees) and saturation, if both are known.
    pub fn get_color_hs(&self) -> Option<(u16, u8)> {
        let state = self.state.read();
        Some((state.hue?, state.saturation?))
    }

    /// Set brightness. In colour mode this re-renders the color string with
    /// the new HSV value component; otherwise it sets the brightness DPS.
    pub async fn set_brightness(&self, brightness: u8, set_on: bool) -> Result<()> {
        self.device.require_dps()?;

        let mut update = self.brightness_dps(brightness);
        if set_on {
            update.insert(DPS_INDEX_ON.into(), Value::Bool(true));
        }
        self.state.write().brightness = Some(brightness);
        self.device.merge_dps(&update);
        self.device
            .send(CommandType::Control, Value::Object(update), true)
            .await
    }

    /// Switch to white mode at the given color temperature.
    pub async fn set_color_temp(&self, color_temp: u8, set_on: bool) -> Result<()> {
        self.device.require_dps()?;

        let mut update = Map::new();
        update.insert(
            DPS_INDEX_MODE.into(),
            Value::String(LightMode::White.to_string()),
        );
        update.insert(DPS_INDEX_COLORTEMP.into(), Value::from(color_temp));
        if set_on {
            update.insert(DPS_INDEX_ON.into(), Value::Bool(true));
        }
        {
            let mut state = self.state.write();
            state.mode = Some(LightMode::White);
            state.color_temp = Some(color_temp);
        }
        self.device.merge_dps(&update);
        self.device
            .send(CommandType::Control, Value::Object(update), true)
            .await
    }

    /// Switch to colour mode showing the given RGB color.
    pub async fn set_color_rgb(&self, red: u8, green: u8, blue: u8, set_on: bool) -> Result<()> {
        self.device.require_dps()?;

        let (hue, saturation, value) = rgb_to_hsv(red, green, blue);
        let color = format!(
            "{}{}",
            rgb_to_hex(red, green, blue),
            hsv_to_hex(hue, saturation, value)
        );

        let mut update = Map::new();
        update.insert(
            DPS_INDEX_MODE.into(),
            Value::String(LightMode::Colour.to_string()),
        );
        update.insert(DPS_INDEX_COLOR.into(), Value::String(color));
        if set_on {
            update.insert(DPS_INDEX_ON.into(), Value::Bool(true));
        }
        {
            let mut state = self.state.write();
            state.mode = Some(LightMode::Colour);
            state.hue = Some(hue);
            state.saturation = Some(saturation);
            state.brightness = Some(value);
        }
        self.device.merge_dps(&update);
        self.device
            .send(CommandType::Control, Value::Object(update), true)
            .await
    }

    /// Switch to colour mode at the given hue (degrees, 0-360) and saturation.
    pub async fn set_color_hs(&self, hue: u16, saturation: u8, set_on: bool) -> Result<()> {
        self.device.require_dps()?;

        let mut update = self.color_hs_dps(hue, saturation)?;
        if set_on {
            update.insert(DPS_INDEX_ON.into(), Value::Bool(true));
        }
        {
            let mut state = self.state.write();
            state.mode = Some(LightMode::Colour);
            state.hue = Some(hue);
            state.saturation = Some(saturation);
        }
        self.device.merge_dps(&update);
        self.device
            .send(CommandType::Control, Value::Object(update), true)
            .await
    }

    /// Apply several light properties in a single CONTROL frame.
    pub async fn set_multiple(&self, changes: LightUpdate) -> Result<()> {
        self.device.require_dps()?;

        let mut update = Map::new();
        if let Some(color_temp) = changes.color_temp {
            update.insert(
                DPS_INDEX_MODE.into(),
                Value::String(LightMode::White.to_string()),
            );
            update.insert(DPS_INDEX_COLORTEMP.into(), Value::from(color_temp));
            let mut state = self.state.write();
            state.mode = Some(LightMode::White);
            state.color_temp = Some(color_temp);
        }
        if let Some((hue, saturation)) = changes.hs_color {
            update.extend(self.color_hs_dps(hue, saturation)?);
            let mut state = self.state.write();
            state.mode = Some(LightMode::Colour);
            state.hue = Some(hue);
            state.saturation = Some(saturation);
        }
        if let Some(brightness) = changes.brightness {
            update.extend(self.brightness_dps(brightness));
            self.state.write().brightness = Some(brightness);
        }
        if let Some(enabled) = changes.enabled {
            update.insert(DPS_INDEX_ON.into(), Value::Bool(enabled));
        }
        if update.is_empty() {
            return Ok(());
        }

        self.device.merge_dps(&update);
        self.device
            .send(CommandType::Control, Value::Object(update), true)
            .await
    }

    fn brightness_dps(&self, brightness: u8) -> Map<String, Value> {
        let state = self.state.read();
        let mut update = Map::new();
        if state.mode == Some(LightMode::Colour) {
            let hue = state.hue.unwrap_or(0);
            let saturation = state.saturation.unwrap_or(0);
            let (red, green, blue) = hsv_to_rgb(
                f64::from(hue) / 360.0,
                f64::from(saturation) / 255.0,
                f64::from(brightness) / 255.0,
            );
            let color = format!(
                "{}{}",
                rgb_to_hex(red, green, blue),
                hsv_to_hex(hue, saturation, brightness)
            );
            update.insert(DPS_INDEX_COLOR.into(), Value::String(color));
        } else {
            update.insert(DPS_INDEX_BRIGHTNESS.into(), Value::from(brightness));
        }
        update
    }

    fn color_hs_dps(&self, hue: u16, saturation: u8) -> Result<Map<String, Value>> {
        if hue > HUE_MAX {
            return Err(TuyaError::OutOfRange {
                name: "hue",
                value: i64::from(hue),
                max: i64::from(HUE_MAX),
            });
        }

        // Re-render the color at the current brightness, full if unknown.
        let value = self.state.read().brightness.unwrap_or(u8::MAX);
        let (red, green, blue) = hsv_to_rgb(
            f64::from(hue) / 360.0,
            f64::from(saturation) / 255.0,
            f64::from(value) / 255.0,
        );

        let mut update = Map::new();
        update.insert(
            DPS_INDEX_MODE.into(),
            Value::String(LightMode::Colour.to_string()),
        );
        update.insert(
            DPS_INDEX_COLOR.into(),
            Value::String(format!(
                "{}{}",
                rgb_to_hex(red, green, blue),
                hsv_to_hex(hue, saturation, value)
            )),
        );
        Ok(update)
    }
}

/// Fold light-relevant DPS values from an inbound payload into derived state.
/// Runs before the base session merges the mirror.
fn apply_payload(state: &RwLock<LightState>, command: u32, payload: &Value) {
    if command != CommandType::Status as u32 && command != CommandType::DpQuery as u32 {
        return;
    }
    let Some(dps) = payload.get("dps").and_then(Value::as_object) else {
        return;
    };
    let mut state = state.write();

    if let Some(mode) = dps.get(DPS_INDEX_MODE).and_then(Value::as_str) {
        match LightMode::parse(mode) {
            Some(parsed) => state.mode = Some(parsed),
            None => warn!("Unknown light mode '{}'", mode),
        }
    }

    // Brightness DPS is only meaningful in white mode; colour mode carries
    // it inside the color string instead.
    if state.mode == Some(LightMode::White)
        && let Some(brightness) = dps.get(DPS_INDEX_BRIGHTNESS).and_then(as_u8)
    {
        state.brightness = Some(brightness);
    }

    if let Some(color_temp) = dps.get(DPS_INDEX_COLORTEMP).and_then(as_u8) {
        state.color_temp = Some(color_temp);
    }

    if let Some(color) = dps.get(DPS_INDEX_COLOR).and_then(Value::as_str) {
        match hex_to_hsv(color) {
            Some((hue, saturation, value)) => {
                state.hue = Some(hue);
                state.saturation = Some(saturation);
                if state.mode == Some(LightMode::Colour) {
                    state.brightness = Some(value);
                }
            }
            None => warn!("Unparseable color string '{}'", color),
        }
    }
}

fn as_u8(value: &Value) -> Option<u8> {
    value.as_u64().and_then(|v| u8::try_from(v).ok())
}

/// Convert fractional HSV (each 0.0-1.0) to 8-bit RGB.
fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (u8, u8, u8) {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    let (r, g, b) = match (i as i64).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    (scale(r), scale(g), scale(b))
}

/// Convert 8-bit RGB to (hue in degrees 0-360, saturation 0-255, value 0-255).
fn rgb_to_hsv(red: u8, green: u8, blue: u8) -> (u16, u8, u8) {
    let r = f64::from(red) / 255.0;
    let g = f64::from(green) / 255.0;
    let b = f64::from(blue) / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max == 0.0 { 0.0 } else { delta / max };

    (hue.round() as u16, scale(saturation), scale(max))
}

fn scale(channel: f64) -> u8 {
    (channel * 255.0).round() as u8
}

/// Encode RGB bytes as 6 hex chars.
fn rgb_to_hex(red: u8, green: u8, blue: u8) -> String {
    hex::encode([red, green, blue])
}

/// Encode hue/saturation/value as 8 hex chars (big-endian u16 hue, u8 sat, u8 val).
fn hsv_to_hex(hue: u16, saturation: u8, value: u8) -> String {
    let [hue_hi, hue_lo] = hue.to_be_bytes();
    hex::encode([hue_hi, hue_lo, saturation, value])
}

/// Decode the HSV tail of a color string, skipping the 3 leading RGB bytes.
fn hex_to_hsv(color: &str) -> Option<(u16, u8, u8)> {
    let bytes = hex::decode(color).ok()?;
    let hsv = bytes.get(3..7)?;
    Some((u16::from_be_bytes([hsv[0], hsv[1]]), hsv[2], hsv[3]))
}
