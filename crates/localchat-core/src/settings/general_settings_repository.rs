use std::path::PathBuf;

use super::general_settings::GeneralSettings;
use crate::repositories::{BoxFuture, RepositoryError, RepositoryResult};

pub trait GeneralSettingsRepository: Send + Sync + 'static {
    /// Load general settings from storage
    fn load(&self) -> BoxFuture<'static, RepositoryResult<GeneralSettings>>;

    /// Save general settings to storage
    fn save(&self, settings: GeneralSettings) -> BoxFuture<'static, RepositoryResult<()>>;
}

pub struct GeneralSettingsJsonRepository {
    file_path: PathBuf,
}

impl GeneralSettingsJsonRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> RepositoryResult<Self> {
        let config_dir = dirs::config_dir().ok_or_else(|| RepositoryError::InitializationError {
            message: "Cannot determine config directory".into(),
        })?;

        Ok(Self::with_path(
            config_dir.join("localchat").join("general_settings.json"),
        ))
    }

    pub fn with_path(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

impl GeneralSettingsRepository for GeneralSettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, RepositoryResult<GeneralSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            if !tokio::fs::try_exists(&path).await? {
                return Ok(GeneralSettings::default());
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            let settings: GeneralSettings = serde_json::from_str(&contents)?;
            Ok(settings)
        })
    }

    fn save(&self, settings: GeneralSettings) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&settings)?;

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, &json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Theme;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GeneralSettingsJsonRepository::with_path(dir.path().join("settings.json"));
        assert_eq!(repo.load().await.unwrap(), GeneralSettings::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let repo = GeneralSettingsJsonRepository::with_path(path.clone());

        let mut settings = GeneralSettings::default();
        settings.theme = Theme::Dark;
        settings.sections.recent = true;
        repo.save(settings.clone()).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(repo.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let repo = GeneralSettingsJsonRepository::with_path(path);
        assert!(matches!(
            repo.load().await,
            Err(RepositoryError::SerializationError(_))
        ));
    }
}
