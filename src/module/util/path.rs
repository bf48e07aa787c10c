//! Path Operations Module
//!
//! This module handles path operations for directories and files.

use std::path::PathBuf;

/// Join Paths
///
/// This function takes a slice of strings as input and joins them into a single path string.
/// It uses the PathBuf type to handle platform-specific separators and conversions.
pub fn join(paths: &[&str]) -> String {
    let mut path: PathBuf = PathBuf::new();
    for p in paths {
        path.push(p);
    }
    path.to_string_lossy().into_owned()
}

pub mod dir {
    //! Directory Operations Submodule
    //!
    //! This submodule provides functions for directory operations.

    use std::fs;
    use std::io;
    use std::path::Path;

    use super::{CarewatchDir, CarewatchFile, CarewatchPath};
    use crate::module::define;

    /// Create Directory from Path List
    ///
    /// This function takes a slice of strings as input and creates a directory with the joined path.
    /// It returns the created path.
    pub fn create_dir_from_path_list(paths: &[&str]) -> io::Result<String> {
        let path = super::join(paths);
        fs::create_dir_all(Path::new(&path))?;
        Ok(path)
    }

    /// Create Subdirectory in Either Directory
    ///
    /// This function takes two directory paths and a subdirectory name as input and creates a subdirectory in one of them.
    /// It uses the first directory as the parent if it exists, otherwise the second one.
    pub fn create_subdir_in_either_dir(dir1: &str, dir2: &str, name: &str) -> io::Result<String> {
        let parent: &str = match Path::new(dir1).is_dir() {
            true => dir1,
            false => dir2,
        };
        create_dir_from_path_list(&[parent, name])
    }

    /// Create Data Directory
    ///
    /// Uses `root` when given, otherwise `define::path::PERSISTENT_DIR` or
    /// `define::path::LOCAL_DIR` depending on which one exists.
    pub fn create_data_dir(root: Option<&str>) -> io::Result<String> {
        match root {
            Some(root) => create_dir_from_path_list(&[root]),
            None => create_subdir_in_either_dir(
                define::path::PERSISTENT_DIR,
                define::path::LOCAL_DIR,
                define::system::NAME,
            ),
        }
    }

    /// Create Application Subdirectory and Paths
    ///
    /// Creates the data directory with its image, frame, log and model subdirectories
    /// and returns the resulting path set.
    pub fn create_app_sub_dir(root: Option<&str>) -> io::Result<CarewatchPath> {
        let data_dir = create_data_dir(root)?;
        let img_dir = create_dir_from_path_list(&[&data_dir, define::path::IMG_DIR])?;
        let frame_dir = create_dir_from_path_list(&[&data_dir, define::path::FRAME_DIR])?;
        let log_dir = create_dir_from_path_list(&[&data_dir, define::path::LOG_DIR])?;
        let model_dir = create_dir_from_path_list(&[&data_dir, define::path::MODEL_DIR])?;
        Ok(CarewatchPath {
            file: CarewatchFile {
                conf: super::join(&[&data_dir, define::path::CONF_FILE]),
                identities: super::join(&[&data_dir, define::path::IDENTITY_FILE]),
            },
            dir: CarewatchDir {
                data: data_dir,
                img: img_dir,
                frames: frame_dir,
                log: log_dir,
                model: model_dir,
            },
        })
    }
}

/// Paths of Resources
///
/// This struct represents the paths of the resources used by the application.
#[derive(Debug, Clone)]
pub struct CarewatchPath {
    /// Directories Paths
    pub dir: CarewatchDir,
    /// Files Paths
    pub file: CarewatchFile,
}

/// Paths of Directories
#[derive(Debug, Clone)]
pub struct CarewatchDir {
    /// Data Directory Path
    pub data: String,
    /// Snapshot Image Directory Path
    pub img: String,
    /// Replayed Frames Directory Path
    pub frames: String,
    /// Log Directory Path
    pub log: String,
    /// Model Directory Path
    pub model: String,
}

/// Paths of Files
#[derive(Debug, Clone)]
pub struct CarewatchFile {
    /// Configuration File Path
    pub conf: String,
    /// Known Identities File Path
    pub identities: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_create_dir_from_path_list() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        dir::create_dir_from_path_list(&[root, "carewatchtest", "nested"]).unwrap();

        // Assert that the directory was created
        assert!(tmp.path().join("carewatchtest/nested").is_dir());
    }

    #[test]
    fn test_create_subdir_in_either_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_str().unwrap();
        let res = dir::create_subdir_in_either_dir("/nonexistent-carewatch", root, "sub").unwrap();

        // Assert that the subdirectory was created in the existing parent
        assert_eq!(res, join(&[root, "sub"]));
        assert!(Path::new(&res).is_dir());
    }

    #[test]
    fn test_create_app_sub_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = join(&[tmp.path().to_str().unwrap(), "data"]);
        let res = dir::create_app_sub_dir(Some(&root)).unwrap();

        assert!(Path::new(&res.dir.img).is_dir());
        assert!(Path::new(&res.dir.frames).is_dir());
        assert!(Path::new(&res.dir.log).is_dir());
        assert!(Path::new(&res.dir.model).is_dir());
        assert_eq!(res.file.conf, join(&[&root, "conf.toml"]));
        assert_eq!(res.file.identities, join(&[&root, "known_faces.json"]));
    }

    #[test]
    fn test_path_join() {
        // Assert that joining two paths works as expected
        assert_eq!(join(&["/test/", "test"]), "/test/test");

        // Assert that joining three paths works as expected
        assert_eq!(join(&["test", "test", "test"]), "test/test/test");

        // Assert that joining relative paths works as expected
        assert_eq!(
            join(&["./test/", "test/", "test.txt"]),
            "./test/test/test.txt"
        );
    }
}
