//! System assembly and lifecycle.
//!
//! Construction order matters: topology and the event bus first (the bus
//! needs topology), then discovery (the bus gets a late back-reference),
//! then the subscription manager (which owns the callback listener and
//! reacts to discovery announcements), then the catalogues, all driven by
//! one scheduler so shutdown drains everything.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use soap_client::SoapClient;
use sonos_discovery::Discovery;
use sonos_eventing::{
    EventManager, SubscriptionConfig, SubscriptionManager, HEALTH_CHECK_PERIOD,
};
use sonos_music::{
    parse_reindex_interval, AccountExtractor, LibraryAdapter, MusicLibrary, MusicService,
    RestStationApi, SavedStationManager, ServicesCache, SpotifyConfig, SpotifySearch, StationApi,
    API_REFRESH_PERIOD, FAVORITES_REFRESH_PERIOD,
};
use sonos_player::Player;
use sonos_scheduler::{Scheduler, TaskOptions};
use sonos_topology::TopologyManager;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::router::{ActionRouter, RouterDeps};
use crate::tts::TtsProvider;

/// Services-table refresh cadence.
const SERVICES_REFRESH_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// Default library re-index cadence when the config does not set one.
const DEFAULT_REINDEX_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// The assembled control core.
pub struct System {
    pub config: Config,
    pub soap: Arc<SoapClient>,
    pub discovery: Arc<Discovery>,
    pub topology: Arc<TopologyManager>,
    pub events: Arc<EventManager>,
    pub scheduler: Arc<Scheduler>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub services: Arc<ServicesCache>,
    pub library: Arc<MusicLibrary>,
    pub stations: Arc<SavedStationManager>,
    pub accounts: Arc<AccountExtractor>,
    /// Typed handle kept alongside the adapter table so the external OAuth
    /// collaborator can inject refreshed bearer tokens
    pub spotify: Arc<SpotifySearch>,
    pub router: Arc<ActionRouter>,
}

impl System {
    /// Build and start every subsystem. Blocks only for the initial
    /// discovery sweep; everything else proceeds on scheduler tasks.
    pub fn start(config: Config, tts: Option<Arc<dyn TtsProvider>>) -> Result<Self> {
        let soap = Arc::new(SoapClient::new());
        let scheduler = Arc::new(Scheduler::new());
        let topology = Arc::new(TopologyManager::new());
        let events = Arc::new(EventManager::new(Arc::clone(&topology)));

        let discovery = Arc::new(
            Discovery::new().map_err(|e| GatewayError::Internal(e.to_string()))?,
        );
        events.set_discovery(Arc::clone(&discovery));

        let subscriptions = SubscriptionManager::start(
            Arc::clone(&events),
            Arc::clone(&discovery),
            Arc::clone(&scheduler),
            SubscriptionConfig::default(),
        )
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let services = Arc::new(ServicesCache::new(
            Arc::clone(&soap),
            Arc::clone(&discovery),
            Arc::clone(&topology),
            config.services_cache_path(),
        ));
        let accounts = Arc::new(AccountExtractor::new(Arc::clone(&services)));
        let library = Arc::new(MusicLibrary::new(config.music_library_path()));

        let station_api: Option<Box<dyn StationApi>> = match (
            config.pandora.endpoint.clone(),
            config.pandora.token.clone(),
        ) {
            (Some(endpoint), Some(token)) => Some(Box::new(RestStationApi::new(endpoint, token))),
            _ => None,
        };
        let stations = Arc::new(SavedStationManager::new(
            config.stations_path(),
            station_api,
            "x-sonosapi-radio",
        ));

        let spotify = Arc::new(SpotifySearch::new(
            Arc::clone(&accounts),
            SpotifyConfig {
                bearer_token: None,
                market: config.spotify.market.clone(),
            },
        ));
        let mut adapters: HashMap<String, Arc<dyn MusicService>> = HashMap::new();
        adapters.insert(
            "library".to_string(),
            Arc::new(LibraryAdapter::new(Arc::clone(&library))),
        );
        adapters.insert(
            "spotify".to_string(),
            Arc::clone(&spotify) as Arc<dyn MusicService>,
        );

        let router = Arc::new(ActionRouter::new(RouterDeps {
            soap: Arc::clone(&soap),
            discovery: Arc::clone(&discovery),
            topology: Arc::clone(&topology),
            events: Arc::clone(&events),
            scheduler: Arc::clone(&scheduler),
            subscriptions: Arc::clone(&subscriptions),
            services: Arc::clone(&services),
            library: Arc::clone(&library),
            stations: Arc::clone(&stations),
            accounts: Arc::clone(&accounts),
            adapters,
            tts,
            config: config.clone(),
        }));

        let system = Self {
            config,
            soap,
            discovery,
            topology,
            events,
            scheduler,
            subscriptions,
            services,
            library,
            stations,
            accounts,
            spotify,
            router,
        };
        system.schedule_background_work();

        // First sweep inline so the first request can already see players
        if let Err(err) = system.discovery.probe() {
            tracing::warn!("initial discovery sweep failed: {err}");
        }
        Ok(system)
    }

    /// All periodic work goes through the one scheduler.
    fn schedule_background_work(&self) {
        // Discovery re-probe: re-arms itself so the cadence can stretch
        // from 30 s to 5 min after the first success
        schedule_probe(
            &self.scheduler,
            Arc::downgrade(&self.scheduler),
            Arc::clone(&self.discovery),
        );

        let events = Arc::clone(&self.events);
        self.scheduler.schedule_interval(
            "event-health-check",
            HEALTH_CHECK_PERIOD,
            TaskOptions::default(),
            move || {
                events.check_health();
            },
        );

        let services = Arc::clone(&self.services);
        self.scheduler.schedule_interval(
            "services-refresh",
            SERVICES_REFRESH_PERIOD,
            TaskOptions::default(),
            move || {
                if let Err(err) = services.refresh() {
                    tracing::warn!("services refresh failed: {err}");
                }
            },
        );

        let stations = Arc::clone(&self.stations);
        let discovery = Arc::clone(&self.discovery);
        let soap = Arc::clone(&self.soap);
        self.scheduler.schedule_interval(
            "stations-favorites-refresh",
            FAVORITES_REFRESH_PERIOD,
            TaskOptions::default(),
            move || {
                let Some(device) = discovery.registry().get_all().into_iter().next() else {
                    return;
                };
                let player = Player::from_device(&device, Arc::clone(&soap));
                if let Err(err) = stations.refresh_from_favorites(&player) {
                    tracing::warn!("station favourites refresh failed: {err}");
                }
            },
        );

        let stations = Arc::clone(&self.stations);
        self.scheduler.schedule_interval(
            "stations-api-refresh",
            API_REFRESH_PERIOD,
            TaskOptions::default(),
            move || {
                if let Err(err) = stations.refresh_from_api() {
                    tracing::warn!("station API refresh failed: {err}");
                }
            },
        );

        let reindex_period = self
            .config
            .reindex_interval
            .as_deref()
            .and_then(parse_reindex_interval)
            .unwrap_or(DEFAULT_REINDEX_PERIOD);
        let library = Arc::clone(&self.library);
        let discovery = Arc::clone(&self.discovery);
        let soap = Arc::clone(&self.soap);
        self.scheduler.schedule_interval(
            "library-reindex",
            reindex_period,
            TaskOptions::default(),
            move || {
                let Some(device) = discovery.registry().get_all().into_iter().next() else {
                    return;
                };
                let player = Player::from_device(&device, Arc::clone(&soap));
                if let Err(err) = library.reindex(&player) {
                    tracing::warn!("library re-index failed: {err}");
                }
            },
        );

        // Account mining piggybacks on the favourites cadence
        let accounts = Arc::clone(&self.accounts);
        let discovery = Arc::clone(&self.discovery);
        let soap = Arc::clone(&self.soap);
        self.scheduler.schedule_interval(
            "account-extraction",
            FAVORITES_REFRESH_PERIOD,
            TaskOptions::default(),
            move || {
                let Some(device) = discovery.registry().get_all().into_iter().next() else {
                    return;
                };
                let player = Player::from_device(&device, Arc::clone(&soap));
                if let Err(err) = accounts.extract(&player) {
                    tracing::debug!("account extraction failed: {err}");
                }
            },
        );
    }

    /// Ordered shutdown: drain the scheduler, then unsubscribe and close
    /// the listener. Idempotent.
    pub fn shutdown(&self) {
        tracing::info!("gateway core shutting down");
        self.scheduler.shutdown();
        self.subscriptions.shutdown();
    }
}

/// One-shot probe task that re-arms itself at the discovery cadence.
fn schedule_probe(scheduler: &Scheduler, weak: Weak<Scheduler>, discovery: Arc<Discovery>) {
    let delay = discovery.probe_interval();
    let next_discovery = Arc::clone(&discovery);
    scheduler.schedule_timeout(
        "discovery-probe",
        delay,
        TaskOptions { unref: true },
        move || {
            if let Err(err) = next_discovery.probe() {
                tracing::warn!("discovery sweep failed: {err}");
            }
            if let Some(scheduler) = weak.upgrade() {
                let weak = Arc::downgrade(&scheduler);
                schedule_probe(&scheduler, weak, next_discovery);
            }
        },
    );
}
