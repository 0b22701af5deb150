//! Capability-oriented device model.
//! Normalizes the divergent JSON command schemas of plugs, dimmers, bulbs and
//! power strips into one typed surface, gated by the facets each device
//! declares in its sysinfo.

use crate::error::{KasaError, Result};
use crate::klap::Credentials;
use crate::transport::{Endpoint, Transport};
use log::info;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock as StdRwLock};

const MODULE_SYSTEM: &str = "system";
const MODULE_EMETER: &str = "emeter";
const MODULE_DIMMER: &str = "smartlife.iot.dimmer";
const MODULE_LIGHTING: &str = "smartlife.iot.smartbulb.lightingservice";
const MODULE_BULB_EMETER: &str = "smartlife.iot.common.emeter";

/// Hardware family, deciding which command modules the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Plug,
    Dimmer,
    Bulb,
    Strip,
}

/// An optional capability a device may or may not support. The set is fixed
/// at construction time from the descriptor; invoking an absent facet's
/// operation fails before any network traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    Switchable,
    Dimmable,
    Colorable,
    Metered,
    MultiOutlet,
}

/// A child outlet of a power strip, as reported in sysinfo.
#[derive(Debug, Clone)]
pub struct ChildOutlet {
    /// Full child id (`<device_id><index:02>`), used for context addressing.
    pub id: String,
    pub alias: String,
    pub relay_on: bool,
}

/// Static identity of a device, decoded from `get_sysinfo`.
/// Fetched once per session and cached on the device handle.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub alias: String,
    pub model: String,
    pub family: DeviceFamily,
    pub sw_ver: String,
    pub facets: Vec<Facet>,
    pub children: Vec<ChildOutlet>,
    /// Supported color-temperature range in kelvin (Colorable devices).
    pub color_temp_range: Option<(u32, u32)>,
}

impl DeviceDescriptor {
    /// Parse a sysinfo document. Field names vary between firmware
    /// generations, so individual lookups are lenient; only the device id is
    /// mandatory.
    pub fn from_sysinfo(sysinfo: &Value) -> Result<Self> {
        let device_id = sysinfo
            .get("deviceId")
            .and_then(Value::as_str)
            .ok_or_else(|| KasaError::Protocol("sysinfo has no deviceId".into()))?
            .to_string();
        let alias = str_field(sysinfo, "alias");
        let model = str_field(sysinfo, "model");
        let sw_ver = str_field(sysinfo, "sw_ver");

        let hw_type = sysinfo
            .get("type")
            .or_else(|| sysinfo.get("mic_type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let is_bulb = hw_type.contains("SMARTBULB");

        let children = parse_children(sysinfo, &device_id);
        let family = if is_bulb {
            DeviceFamily::Bulb
        } else if !children.is_empty() {
            DeviceFamily::Strip
        } else if sysinfo.get("brightness").is_some() {
            DeviceFamily::Dimmer
        } else {
            DeviceFamily::Plug
        };

        let mut facets = vec![Facet::Switchable];
        let dimmable = match family {
            DeviceFamily::Bulb => flag(sysinfo, "is_dimmable"),
            DeviceFamily::Dimmer => true,
            _ => false,
        };
        if dimmable {
            facets.push(Facet::Dimmable);
        }
        let colorable = is_bulb && flag(sysinfo, "is_variable_color_temp");
        if colorable {
            facets.push(Facet::Colorable);
        }
        // Plug-family metering is advertised in the feature string; every
        // bulb generation carries an emeter module.
        let feature = str_field(sysinfo, "feature");
        if is_bulb || feature.contains("ENE") {
            facets.push(Facet::Metered);
        }
        if !children.is_empty() {
            facets.push(Facet::MultiOutlet);
        }

        let color_temp_range = colorable.then(|| color_temp_range_for(&model));

        Ok(Self {
            device_id,
            alias,
            model,
            family,
            sw_ver,
            facets,
            children,
            color_temp_range,
        })
    }

    pub fn has(&self, facet: Facet) -> bool {
        self.facets.contains(&facet)
    }
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn flag(v: &Value, key: &str) -> bool {
    v.get(key).and_then(Value::as_i64).unwrap_or(0) != 0
}

fn parse_children(sysinfo: &Value, device_id: &str) -> Vec<ChildOutlet> {
    let Some(list) = sysinfo.get("children").and_then(Value::as_array) else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|c| {
            let raw = c.get("id").and_then(Value::as_str)?;
            // Sysinfo reports the two-digit suffix; context addressing
            // needs the full id.
            let id = if raw.len() < device_id.len() {
                format!("{}{}", device_id, raw)
            } else {
                raw.to_string()
            };
            Some(ChildOutlet {
                id,
                alias: str_field(c, "alias"),
                relay_on: flag(c, "state"),
            })
        })
        .collect()
}

/// Color-temperature ranges by model prefix, from the hardware line specs.
fn color_temp_range_for(model: &str) -> (u32, u32) {
    const RANGES: &[(&str, (u32, u32))] = &[
        ("LB120", (2700, 6500)),
        ("LB130", (2500, 9000)),
        ("KL120", (2700, 5000)),
        ("KL125", (2500, 6500)),
        ("KL130", (2500, 9000)),
        ("KL135", (2500, 6500)),
        ("KL430", (2500, 9000)),
    ];
    RANGES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|&(_, range)| range)
        .unwrap_or((2700, 6500))
}

/// Instantaneous metering reading. Parses both the milli-unit schema of newer
/// firmware (`power_mw`, ...) and the float schema of older firmware.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyReading {
    pub power_w: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub total_wh: f64,
}

impl EnergyReading {
    fn from_realtime(v: &Value) -> Self {
        fn scaled(v: &Value, milli_key: &str, unit_key: &str, div: f64) -> f64 {
            if let Some(m) = v.get(milli_key).and_then(Value::as_f64) {
                m / div
            } else {
                v.get(unit_key).and_then(Value::as_f64).unwrap_or(0.0)
            }
        }
        Self {
            power_w: scaled(v, "power_mw", "power", 1000.0),
            voltage_v: scaled(v, "voltage_mv", "voltage", 1000.0),
            current_a: scaled(v, "current_ma", "current", 1000.0),
            total_wh: scaled(v, "total_wh", "total", 1.0),
        }
    }
}

/// Per-poll snapshot of mutable device state. A new snapshot is produced per
/// poll and never mutated in place, so concurrent readers stay safe.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub relay_on: bool,
    pub brightness: Option<u8>,
    pub color_temp: Option<u32>,
    /// Seconds the relay has been on, from sysinfo `on_time`.
    pub on_since_secs: Option<u64>,
    pub energy: Option<EnergyReading>,
}

impl DeviceState {
    fn from_sysinfo(family: DeviceFamily, sysinfo: &Value) -> Self {
        match family {
            DeviceFamily::Bulb => {
                let light = sysinfo.get("light_state").cloned().unwrap_or(Value::Null);
                let on = flag(&light, "on_off");
                // When off, the target levels live under dft_on_state.
                let levels = if on {
                    light.clone()
                } else {
                    light.get("dft_on_state").cloned().unwrap_or(light.clone())
                };
                Self {
                    relay_on: on,
                    brightness: levels
                        .get("brightness")
                        .and_then(Value::as_u64)
                        .map(|b| b as u8),
                    color_temp: levels
                        .get("color_temp")
                        .and_then(Value::as_u64)
                        .map(|k| k as u32),
                    on_since_secs: None,
                    energy: None,
                }
            }
            _ => Self {
                relay_on: flag(sysinfo, "relay_state"),
                brightness: sysinfo
                    .get("brightness")
                    .and_then(Value::as_u64)
                    .map(|b| b as u8),
                color_temp: None,
                on_since_secs: sysinfo.get("on_time").and_then(Value::as_u64),
                energy: None,
            },
        }
    }
}

/// Build a module/method/args command document.
pub fn command(module: &str, method: &str, args: Value) -> Value {
    let mut inner = serde_json::Map::new();
    inner.insert(method.to_string(), args);
    let mut doc = serde_json::Map::new();
    doc.insert(module.to_string(), Value::Object(inner));
    Value::Object(doc)
}

/// Extract a method result from a response document, treating the mirrored
/// `err_code` as the only authoritative success indicator.
pub fn extract(response: &Value, module: &str, method: &str) -> Result<Value> {
    let module_obj = response
        .get(module)
        .ok_or_else(|| KasaError::Protocol(format!("response missing module {:?}", module)))?;

    // Some firmware reports module-level failure without echoing the method.
    if let Some(code) = module_obj.get("err_code").and_then(Value::as_i64)
        && code != 0
    {
        return Err(KasaError::Device(code));
    }

    let result = module_obj
        .get(method)
        .ok_or_else(|| KasaError::Protocol(format!("response missing method {:?}", method)))?;
    if let Some(code) = result.get("err_code").and_then(Value::as_i64)
        && code != 0
    {
        return Err(KasaError::Device(code));
    }
    Ok(result.clone())
}

struct DeviceInner {
    transport: Arc<Transport>,
    descriptor: StdRwLock<DeviceDescriptor>,
}

/// A handle to one physical device: the typed operation surface over its
/// transport, plus the raw `call` escape hatch for modules the capability
/// model does not cover.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Wrap an already-known device (e.g. from a discovery summary).
    pub fn new(transport: Arc<Transport>, descriptor: DeviceDescriptor) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                transport,
                descriptor: StdRwLock::new(descriptor),
            }),
        }
    }

    /// Connect to a known endpoint and build the handle from a fresh sysinfo
    /// fetch.
    pub async fn connect(endpoint: Endpoint, credentials: Credentials) -> Result<Self> {
        let transport = Arc::new(Transport::new(endpoint, credentials));
        let sysinfo = fetch_sysinfo(&transport).await?;
        let descriptor = DeviceDescriptor::from_sysinfo(&sysinfo)?;
        Ok(Self::new(transport, descriptor))
    }

    pub fn id(&self) -> String {
        self.with_descriptor(|d| d.device_id.clone())
    }

    pub fn alias(&self) -> String {
        self.with_descriptor(|d| d.alias.clone())
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        self.with_descriptor(Clone::clone)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.inner.transport
    }

    pub fn supports(&self, facet: Facet) -> bool {
        self.with_descriptor(|d| d.has(facet))
    }

    fn with_descriptor<R>(&self, f: impl FnOnce(&DeviceDescriptor) -> R) -> R {
        f(&self.inner.descriptor.read().expect("descriptor lock poisoned"))
    }

    fn require(&self, facet: Facet, op: &str) -> Result<()> {
        if self.supports(facet) {
            Ok(())
        } else {
            Err(KasaError::UnsupportedOperation(format!(
                "{} requires the {:?} facet",
                op, facet
            )))
        }
    }

    fn family(&self) -> DeviceFamily {
        self.with_descriptor(|d| d.family)
    }

    /// Replace the cached descriptor (discovery refresh or firmware change).
    pub(crate) fn replace_descriptor(&self, descriptor: DeviceDescriptor) {
        let mut guard = self.inner.descriptor.write().expect("descriptor lock poisoned");
        if guard.sw_ver != descriptor.sw_ver {
            info!(
                "Device {} firmware changed {} -> {}, descriptor invalidated",
                descriptor.device_id, guard.sw_ver, descriptor.sw_ver
            );
        }
        *guard = descriptor;
    }

    // ---------------------------------------------------------------------
    // Raw escape hatch
    // ---------------------------------------------------------------------

    /// Issue an arbitrary module/method command and return its result.
    /// Firmware revisions grow undocumented modules faster than the facet
    /// model tracks them; this is the supported way to reach those.
    pub async fn call(&self, module: &str, method: &str, args: Value) -> Result<Value> {
        let response = self
            .inner
            .transport
            .call(&command(module, method, args))
            .await?;
        extract(&response, module, method)
    }

    /// Issue a pre-built command document and return the raw mirrored
    /// response without any err_code interpretation.
    pub async fn call_raw(&self, request: &Value) -> Result<Value> {
        self.inner.transport.call(request).await
    }

    // ---------------------------------------------------------------------
    // Typed operations
    // ---------------------------------------------------------------------

    /// Fetch a fresh state snapshot (plus a metering reading when the device
    /// has the facet). Also refreshes the cached descriptor if the firmware
    /// version changed since the last fetch.
    pub async fn get_state(&self) -> Result<DeviceState> {
        let sysinfo = fetch_sysinfo(&self.inner.transport).await?;
        if let Ok(fresh) = DeviceDescriptor::from_sysinfo(&sysinfo)
            && self.with_descriptor(|d| d.sw_ver != fresh.sw_ver)
        {
            self.replace_descriptor(fresh);
        }

        let mut state = DeviceState::from_sysinfo(self.family(), &sysinfo);
        if self.supports(Facet::Metered) {
            state.energy = Some(self.get_energy_usage().await?);
        }
        Ok(state)
    }

    /// Switch the relay (or the bulb's light state).
    pub async fn set_relay(&self, on: bool) -> Result<()> {
        self.require(Facet::Switchable, "set_relay")?;
        let state = i32::from(on);
        match self.family() {
            DeviceFamily::Bulb => {
                self.call(
                    MODULE_LIGHTING,
                    "transition_light_state",
                    json!({ "on_off": state }),
                )
                .await?;
            }
            _ => {
                self.call(MODULE_SYSTEM, "set_relay_state", json!({ "state": state }))
                    .await?;
            }
        }
        Ok(())
    }

    /// Set brightness, 0..=100. Out-of-range values are rejected before any
    /// command is sent.
    pub async fn set_brightness(&self, value: u8) -> Result<()> {
        self.require(Facet::Dimmable, "set_brightness")?;
        if value > 100 {
            return Err(KasaError::InvalidParameter(format!(
                "brightness {} outside 0..=100",
                value
            )));
        }
        match self.family() {
            DeviceFamily::Bulb => {
                self.call(
                    MODULE_LIGHTING,
                    "transition_light_state",
                    json!({ "brightness": value, "on_off": 1 }),
                )
                .await?;
            }
            _ => {
                self.call(MODULE_DIMMER, "set_brightness", json!({ "brightness": value }))
                    .await?;
            }
        }
        Ok(())
    }

    /// Set color temperature in kelvin, validated against the model's range
    /// before transmission.
    pub async fn set_color_temperature(&self, kelvin: u32) -> Result<()> {
        self.require(Facet::Colorable, "set_color_temperature")?;
        let (lo, hi) = self
            .with_descriptor(|d| d.color_temp_range)
            .unwrap_or((2700, 6500));
        if kelvin < lo || kelvin > hi {
            return Err(KasaError::InvalidParameter(format!(
                "color temperature {}K outside supported range {}..={}K",
                kelvin, lo, hi
            )));
        }
        self.call(
            MODULE_LIGHTING,
            "transition_light_state",
            json!({ "color_temp": kelvin, "on_off": 1 }),
        )
        .await?;
        Ok(())
    }

    /// Fetch an instantaneous metering reading.
    pub async fn get_energy_usage(&self) -> Result<EnergyReading> {
        self.require(Facet::Metered, "get_energy_usage")?;
        let module = match self.family() {
            DeviceFamily::Bulb => MODULE_BULB_EMETER,
            _ => MODULE_EMETER,
        };
        let result = self.call(module, "get_realtime", json!({})).await?;
        Ok(EnergyReading::from_realtime(&result))
    }

    /// Rename the device.
    pub async fn set_alias(&self, alias: &str) -> Result<()> {
        self.call(MODULE_SYSTEM, "set_dev_alias", json!({ "alias": alias }))
            .await?;
        Ok(())
    }

    /// Switch the status LED (night mode).
    pub async fn set_led(&self, on: bool) -> Result<()> {
        self.call(
            MODULE_SYSTEM,
            "set_led_off",
            json!({ "off": i32::from(!on) }),
        )
        .await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Child outlets
    // ---------------------------------------------------------------------

    /// Number of child outlets (0 for non-strip devices).
    pub fn child_count(&self) -> usize {
        self.with_descriptor(|d| d.children.len())
    }

    /// Handle to one child outlet. The index is validated here, before any
    /// command can be sent through the handle.
    pub fn outlet(&self, index: usize) -> Result<Outlet> {
        self.require(Facet::MultiOutlet, "outlet")?;
        let (count, child_id) = self.with_descriptor(|d| {
            (d.children.len(), d.children.get(index).map(|c| c.id.clone()))
        });
        let Some(child_id) = child_id else {
            return Err(KasaError::InvalidChildIndex { index, count });
        };
        Ok(Outlet {
            device: self.clone(),
            index,
            child_id,
        })
    }
}

async fn fetch_sysinfo(transport: &Transport) -> Result<Value> {
    let response = transport
        .call(&command(MODULE_SYSTEM, "get_sysinfo", json!({})))
        .await?;
    extract(&response, MODULE_SYSTEM, "get_sysinfo")
}

/// One addressable outlet of a power strip. Commands are routed through the
/// parent's transport with a `context.child_ids` envelope.
#[derive(Clone)]
pub struct Outlet {
    device: Device,
    index: usize,
    child_id: String,
}

impl Outlet {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn child_id(&self) -> &str {
        &self.child_id
    }

    async fn call(&self, module: &str, method: &str, args: Value) -> Result<Value> {
        let mut request = command(module, method, args);
        request["context"] = json!({ "child_ids": [self.child_id] });
        let response = self.device.inner.transport.call(&request).await?;
        extract(&response, module, method)
    }

    /// Switch this outlet's relay.
    pub async fn set_relay(&self, on: bool) -> Result<()> {
        self.call(
            MODULE_SYSTEM,
            "set_relay_state",
            json!({ "state": i32::from(on) }),
        )
        .await?;
        Ok(())
    }

    /// Snapshot of this outlet's state from the parent's sysinfo.
    pub async fn get_state(&self) -> Result<DeviceState> {
        let sysinfo = fetch_sysinfo(&self.device.inner.transport).await?;
        let children = parse_children(&sysinfo, &self.device.id());
        let child = children
            .iter()
            .find(|c| c.id == self.child_id)
            .ok_or_else(|| {
                KasaError::Protocol(format!("child {} missing from sysinfo", self.child_id))
            })?;
        Ok(DeviceState {
            relay_on: child.relay_on,
            brightness: None,
            color_temp: None,
            on_since_secs: None,
            energy: None,
        })
    }

    /// Per-outlet metering reading (strips meter each child separately).
    pub async fn get_energy_usage(&self) -> Result<EnergyReading> {
        self.device.require(Facet::Metered, "get_energy_usage")?;
        let result = self.call(MODULE_EMETER, "get_realtime", json!({})).await?;
        Ok(EnergyReading::from_realtime(&result))
    }
}
