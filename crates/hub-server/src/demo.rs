//! Built-in `demo` integration
//!
//! A simulated weather station: one coordinator polls the station and
//! feeds temperature and humidity sensors, a rain binary sensor and a
//! sprinkler switch.
//!
//! Entry data: `name` (defaults to the entry title) and `base_temperature`.
//! Options: `scan_interval` in seconds (default 30).

use async_trait::async_trait;
use hub_config_entries::{ConfigEntryError, EntryHandle, Integration, Platform};
use hub_coordinator::{Coordinator, UpdateError};
use hub_core::PlatformDomain;
use hub_entity::{
    AddEntities, CoordinatorEntity, CoordinatorValueEntity, Entity, EntityDescription,
    EntityHandle, EntityResult, ToggleEntity, ValueDescription,
};
use rand::Rng;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

pub const DOMAIN: &str = "demo";

const DEFAULT_SCAN_INTERVAL: u64 = 30;
const DEFAULT_BASE_TEMPERATURE: f64 = 18.0;

const PLATFORMS: [PlatformDomain; 3] = [
    PlatformDomain::Sensor,
    PlatformDomain::BinarySensor,
    PlatformDomain::Switch,
];

#[derive(Debug, Clone, PartialEq)]
pub struct StationReading {
    pub temperature: f64,
    pub humidity: f64,
    pub raining: bool,
    pub sprinkler: bool,
}

#[derive(Debug)]
struct StationState {
    temperature: f64,
    humidity: f64,
    sprinkler: bool,
}

/// Stand-in for a vendor SDK with blocking calls
#[derive(Debug)]
pub struct SimulatedStation {
    state: Mutex<StationState>,
}

impl SimulatedStation {
    pub fn new(base_temperature: f64) -> Self {
        Self {
            state: Mutex::new(StationState {
                temperature: base_temperature,
                humidity: 55.0,
                sprinkler: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StationState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Blocking read of the current conditions
    pub fn read(&self) -> StationReading {
        let mut rng = rand::thread_rng();
        let mut state = self.lock();
        state.temperature += rng.gen_range(-0.5..=0.5);
        state.humidity = (state.humidity + rng.gen_range(-2.0..=2.0)).clamp(0.0, 100.0);

        StationReading {
            temperature: round_tenth(state.temperature),
            humidity: round_tenth(state.humidity),
            raining: state.humidity > 85.0,
            sprinkler: state.sprinkler,
        }
    }

    pub fn set_sprinkler(&self, on: bool) {
        self.lock().sprinkler = on;
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// What a loaded demo entry keeps at runtime
pub struct DemoRuntime {
    pub coordinator: Coordinator<StationReading>,
    pub station: Arc<SimulatedStation>,
    pub device_id: String,
}

fn runtime(entry: &EntryHandle) -> Result<Arc<DemoRuntime>, ConfigEntryError> {
    entry
        .runtime_data::<DemoRuntime>()
        .ok_or_else(|| ConfigEntryError::failed("demo runtime data missing"))
}

pub struct DemoIntegration;

#[async_trait]
impl Integration for DemoIntegration {
    fn domain(&self) -> &str {
        DOMAIN
    }

    fn reload_on_update(&self) -> bool {
        true
    }

    fn platforms(&self) -> Vec<(PlatformDomain, Arc<dyn Platform>)> {
        vec![
            (PlatformDomain::Sensor, Arc::new(DemoSensors)),
            (PlatformDomain::BinarySensor, Arc::new(DemoBinarySensors)),
            (PlatformDomain::Switch, Arc::new(DemoSwitches)),
        ]
    }

    async fn setup_entry(&self, entry: &EntryHandle) -> Result<(), ConfigEntryError> {
        let config = entry.entry();
        let name = config
            .data_value::<String>("name")
            .unwrap_or_else(|| config.title.clone());
        let base_temperature = config
            .data_value::<f64>("base_temperature")
            .unwrap_or(DEFAULT_BASE_TEMPERATURE);
        let scan_interval = config
            .option_value::<u64>("scan_interval")
            .unwrap_or(DEFAULT_SCAN_INTERVAL)
            .max(1);

        let station = Arc::new(SimulatedStation::new(base_temperature));
        let hub = Arc::clone(entry.hub());
        let polled = Arc::clone(&station);
        let coordinator = Coordinator::builder(name.clone(), move || {
            let hub = Arc::clone(&hub);
            let station = Arc::clone(&polled);
            async move {
                hub.run_blocking(move || station.read())
                    .await
                    .map_err(|err| UpdateError::failed(err.to_string()))
            }
        })
        .settings(entry.hub().coordinator_settings())
        .update_interval(Duration::from_secs(scan_interval))
        .build();

        entry.register_coordinator(&coordinator);
        coordinator.config_entry_first_refresh().await?;
        info!(station = %name, scan_interval, "Demo station online");

        entry.set_runtime_data(DemoRuntime {
            coordinator,
            station,
            device_id: config.unique_id.unwrap_or(config.entry_id),
        });
        entry.forward_entry_setups(&PLATFORMS).await
    }
}

struct DemoSensors;

#[async_trait]
impl Platform for DemoSensors {
    async fn setup_entry(
        &self,
        entry: &EntryHandle,
        add_entities: AddEntities,
    ) -> Result<(), ConfigEntryError> {
        let runtime = runtime(entry)?;
        let descriptions = [
            ValueDescription::new(
                EntityDescription::new("temperature")
                    .name("Temperature")
                    .device_class("temperature")
                    .unit("°C"),
                |r: &StationReading| Some(json!(r.temperature)),
            ),
            ValueDescription::new(
                EntityDescription::new("humidity")
                    .name("Humidity")
                    .device_class("humidity")
                    .unit("%"),
                |r: &StationReading| Some(json!(r.humidity)),
            ),
        ];
        let entities: Vec<Arc<dyn Entity>> = descriptions
            .into_iter()
            .map(|description| {
                Arc::new(CoordinatorValueEntity::new(
                    runtime.coordinator.clone(),
                    &runtime.device_id,
                    description,
                )) as Arc<dyn Entity>
            })
            .collect();
        add_entities.add(entities, false).await;
        Ok(())
    }
}

struct DemoBinarySensors;

#[async_trait]
impl Platform for DemoBinarySensors {
    async fn setup_entry(
        &self,
        entry: &EntryHandle,
        add_entities: AddEntities,
    ) -> Result<(), ConfigEntryError> {
        let runtime = runtime(entry)?;
        let rain = CoordinatorValueEntity::new(
            runtime.coordinator.clone(),
            &runtime.device_id,
            ValueDescription::new(
                EntityDescription::new("rain")
                    .name("Rain")
                    .device_class("moisture"),
                |r: &StationReading| Some(json!(r.raining)),
            ),
        );
        add_entities.add(vec![Arc::new(rain)], false).await;
        Ok(())
    }
}

struct DemoSwitches;

#[async_trait]
impl Platform for DemoSwitches {
    async fn setup_entry(
        &self,
        entry: &EntryHandle,
        add_entities: AddEntities,
    ) -> Result<(), ConfigEntryError> {
        let runtime = runtime(entry)?;
        let sprinkler = SprinklerSwitch {
            binding: CoordinatorEntity::with_context(
                runtime.coordinator.clone(),
                Some("sprinkler".to_string()),
            ),
            station: Arc::clone(&runtime.station),
            unique_id: format!("{}_sprinkler", runtime.device_id),
        };
        add_entities.add(vec![Arc::new(sprinkler)], false).await;
        Ok(())
    }
}

/// Sprinkler valve; its reported state comes back through the coordinator
struct SprinklerSwitch {
    binding: CoordinatorEntity<StationReading>,
    station: Arc<SimulatedStation>,
    unique_id: String,
}

impl SprinklerSwitch {
    async fn set(&self, on: bool) {
        debug!(on, "Switching sprinkler");
        self.station.set_sprinkler(on);
        self.binding.coordinator().refresh().await;
    }
}

#[async_trait]
impl Entity for SprinklerSwitch {
    fn unique_id(&self) -> Option<String> {
        Some(self.unique_id.clone())
    }

    fn name(&self) -> Option<String> {
        Some("Sprinkler".to_string())
    }

    fn state(&self) -> Option<String> {
        self.is_on()
            .map(|on| if on { "on" } else { "off" }.to_string())
    }

    fn available(&self) -> bool {
        self.binding.available()
    }

    async fn update(&self) -> EntityResult<()> {
        self.binding.update().await;
        Ok(())
    }

    async fn added_to_hub(&self, handle: EntityHandle) {
        self.binding.attach(&handle);
    }

    async fn will_remove_from_hub(&self) {
        self.binding.detach();
    }

    fn as_toggle(&self) -> Option<&dyn ToggleEntity> {
        Some(self)
    }
}

#[async_trait]
impl ToggleEntity for SprinklerSwitch {
    fn is_on(&self) -> Option<bool> {
        self.binding.data().map(|reading| reading.sprinkler)
    }

    async fn turn_on(&self) -> EntityResult<()> {
        self.set(true).await;
        Ok(())
    }

    async fn turn_off(&self) -> EntityResult<()> {
        self.set(false).await;
        Ok(())
    }
}
