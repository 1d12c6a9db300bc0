pub mod cdm;
pub mod config;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod plan;
pub mod service;
pub mod title;

pub use cdm::{
    CdmEngine, CdmError, CdmGateway, CdmResult, CdmSession, ContentKey, LicenseFraming,
    RemoteEngine, WidevineDevice,
};
pub use config::{
    load_global_config, load_profile, load_service_overrides, save_profile, AuthCache,
    CdmSection, GlobalConfig, Profile, ServiceOverrides,
};
pub use error::{ConfigError, Result};
pub use orchestrator::{
    CacheKey, CacheRecord, DownloadCache, Orchestrator, OrchestratorError, OrchestratorResult,
    RunOptions, RunReport, TitleState,
};
pub use plan::{plan_titles, PlanError, PlanOutcome, PlanResult, SelectOptions};
pub use service::registry::{build_adapter, RegistryEntry, ServicePaths, ServiceRegistry};
pub use service::{
    ManifestKind, MediaInfo, Playlist, RunContext, SearchHit, ServiceAdapter, ServiceError,
    ServiceResult, UrlKind,
};
pub use title::{Episode, Movie, MovieGroup, Series, Title};
