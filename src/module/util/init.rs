//! This module is responsible for preparing the resources needed by the application, such as directories and configurations.
//!

pub mod resource {
    use super::CarewatchProperty;
    use crate::module::error::ConfigError;

    /// Initialize the application resources and return a CarewatchProperty instance containing paths and configurations.
    ///
    /// `root` overrides the data directory.
    pub fn init(root: Option<&str>) -> Result<CarewatchProperty, ConfigError> {
        // Prepare the app data directory
        let paths = crate::module::util::path::dir::create_app_sub_dir(root)?;

        // Load the app configuration file
        let conf = crate::module::util::conf::toml::load(&paths.dir.data)?;

        Ok(CarewatchProperty { path: paths, conf })
    }
}

/// This struct represents the properties of the app, such as paths and configurations.
///
#[derive(Debug, Clone)]
pub struct CarewatchProperty {
    pub path: crate::module::util::path::CarewatchPath, // The paths of the app resources
    pub conf: crate::module::util::conf::Config,        // The configurations of the app
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_test() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("data");
        let property = resource::init(root.to_str()).unwrap();
        assert!(std::path::Path::new(&property.path.file.conf).is_file());
        assert_eq!(
            property.conf.camera.source,
            crate::module::util::conf::DEFAULT_SOURCE
        );
    }
}
