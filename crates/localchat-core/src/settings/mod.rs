pub mod general_settings;
pub mod general_settings_repository;
pub mod inference_settings;

pub use general_settings::{GeneralSettings, SectionFlags, Theme};
pub use general_settings_repository::{GeneralSettingsJsonRepository, GeneralSettingsRepository};
pub use inference_settings::{InferenceSettings, ProviderKind};
