//! GP4 project model and XML writer.
//!
//! A `Project.gp4` describes the source tree a package was (or could be)
//! built from: one `<volume>` with package attributes, a flat `<files>`
//! list, and a nested `<rootdir>` mirror of the directory tree.

use aeolia_pkg::header::ContentType;
use std::fmt::Write as _;
use std::path::Path;

/// GP4 volume types, mapped from the package content type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeType {
    App,
    Patch,
    AcData,
    AcNodata,
}

impl VolumeType {
    /// Maps a package content type onto its project volume type.
    #[must_use]
    pub fn from_content_type(ty: ContentType) -> Option<Self> {
        match ty {
            ContentType::Gd => Some(Self::App),
            ContentType::Dp => Some(Self::Patch),
            ContentType::Ac => Some(Self::AcData),
            ContentType::Al => Some(Self::AcNodata),
            ContentType::Unknown(_) => None,
            _ => unreachable!("ContentType has no other variants"),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::App => "pkg_ps4_app",
            Self::Patch => "pkg_ps4_patch",
            Self::AcData => "pkg_ps4_ac_data",
            Self::AcNodata => "pkg_ps4_ac_nodata",
        }
    }
}

/// One `<file>` element: where the file lands in the image and where its
/// source lives, both project-relative with forward slashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gp4File {
    pub targ_path: String,
    pub orig_path: String,
}

/// One `<dir>` element with its nested subdirectories.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gp4Dir {
    pub name: String,
    pub children: Vec<Gp4Dir>,
}

/// An in-memory GP4 project.
#[derive(Clone, Debug)]
#[must_use]
pub struct Gp4Project {
    pub volume_type: VolumeType,
    /// Volume timestamp, `YYYY-MM-DD HH:MM:SS` UTC.
    pub volume_timestamp: String,
    pub content_id: String,
    pub passcode: String,
    /// Entitlement key as lowercase hex, for additional-content volumes.
    pub entitlement_key: Option<String>,
    pub storage_type: &'static str,
    pub app_type: &'static str,
    /// Creation date recovered from `PUBTOOLINFO`, empty when unknown.
    pub creation_date: String,
    files: Vec<Gp4File>,
    root: Vec<Gp4Dir>,
}

impl Gp4Project {
    pub fn new(volume_type: VolumeType, content_id: &str, passcode: &str) -> Self {
        Self {
            volume_type,
            volume_timestamp: String::new(),
            content_id: content_id.to_string(),
            passcode: passcode.to_string(),
            entitlement_key: None,
            storage_type: "digital50",
            app_type: "full",
            creation_date: String::new(),
            files: Vec::new(),
            root: Vec::new(),
        }
    }

    /// Records a file by its project-relative path (forward slashes).
    pub fn add_file(&mut self, path: &str) {
        self.files.push(Gp4File {
            targ_path: path.to_string(),
            orig_path: path.to_string(),
        });
    }

    /// Records a directory chain, creating any missing parents.
    pub fn add_dir(&mut self, path: &str) {
        let mut level = &mut self.root;

        for part in path.split('/').filter(|p| !p.is_empty()) {
            let at = match level.iter().position(|d| d.name == part) {
                Some(at) => at,
                None => {
                    level.push(Gp4Dir {
                        name: part.to_string(),
                        children: Vec::new(),
                    });
                    level.len() - 1
                }
            };

            level = &mut level[at].children;
        }
    }

    /// Returns the recorded files in insertion order.
    pub fn files(&self) -> &[Gp4File] {
        &self.files
    }

    /// Returns the top-level directories.
    pub fn root_dirs(&self) -> &[Gp4Dir] {
        &self.root
    }

    /// Renders the project as a GP4 XML document.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();

        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
        out.push_str("<psproject fmt=\"gp4\" version=\"1000\">\n");

        out.push_str("  <volume>\n");
        let _ = writeln!(
            out,
            "    <volume_type>{}</volume_type>",
            self.volume_type.as_str()
        );
        let _ = writeln!(
            out,
            "    <volume_ts>{}</volume_ts>",
            escape(&self.volume_timestamp)
        );

        let _ = write!(
            out,
            "    <package content_id=\"{}\" passcode=\"{}\" storage_type=\"{}\" app_type=\"{}\" c_date=\"{}\"",
            escape(&self.content_id),
            escape(&self.passcode),
            self.storage_type,
            self.app_type,
            escape(&self.creation_date),
        );
        if let Some(key) = &self.entitlement_key {
            let _ = write!(out, " entitlement_key=\"{}\"", escape(key));
        }
        out.push_str("/>\n");
        out.push_str("  </volume>\n");

        out.push_str("  <files img_no=\"0\">\n");
        for file in &self.files {
            let _ = writeln!(
                out,
                "    <file targ_path=\"{}\" orig_path=\"{}\"/>",
                escape(&file.targ_path),
                escape(&file.orig_path)
            );
        }
        out.push_str("  </files>\n");

        out.push_str("  <rootdir>\n");
        for dir in &self.root {
            write_dir(&mut out, dir, 2);
        }
        out.push_str("  </rootdir>\n");

        out.push_str("</psproject>\n");
        out
    }

    /// Writes the project file to disk.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.to_xml())
    }
}

fn write_dir(out: &mut String, dir: &Gp4Dir, depth: usize) {
    let indent = "  ".repeat(depth);

    if dir.children.is_empty() {
        let _ = writeln!(out, "{indent}<dir targ_name=\"{}\"/>", escape(&dir.name));
        return;
    }

    let _ = writeln!(out, "{indent}<dir targ_name=\"{}\">", escape(&dir.name));
    for child in &dir.children {
        write_dir(out, child, depth + 1);
    }
    let _ = writeln!(out, "{indent}</dir>");
}

/// Escapes the XML attribute/text special characters.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_types_map_from_content_types() {
        assert_eq!(
            VolumeType::from_content_type(ContentType::Gd),
            Some(VolumeType::App)
        );
        assert_eq!(
            VolumeType::from_content_type(ContentType::Dp),
            Some(VolumeType::Patch)
        );
        assert_eq!(
            VolumeType::from_content_type(ContentType::Ac),
            Some(VolumeType::AcData)
        );
        assert_eq!(
            VolumeType::from_content_type(ContentType::Al),
            Some(VolumeType::AcNodata)
        );
        assert_eq!(VolumeType::from_content_type(ContentType::Unknown(9)), None);
    }

    #[test]
    fn xml_contains_volume_files_and_tree() {
        let mut project = Gp4Project::new(
            VolumeType::App,
            "AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ",
            "00000000000000000000000000000000",
        );
        project.volume_timestamp = "2020-09-13 12:26:40".into();
        project.creation_date = "2024-01-01 12:00:00".into();

        project.add_dir("sce_sys");
        project.add_file("sce_sys/param.sfo");
        project.add_dir("data/sub");
        project.add_file("data/sub/level.dat");
        project.add_file("eboot.bin");

        let xml = project.to_xml();

        assert!(xml.contains("<volume_type>pkg_ps4_app</volume_type>"));
        assert!(xml.contains("<volume_ts>2020-09-13 12:26:40</volume_ts>"));
        assert!(xml.contains("content_id=\"AA0000-BBBB00000_00-ZZZZZZZZZZZZZZZZ\""));
        assert!(xml.contains("c_date=\"2024-01-01 12:00:00\""));
        assert!(xml.contains("<file targ_path=\"sce_sys/param.sfo\" orig_path=\"sce_sys/param.sfo\"/>"));
        assert!(xml.contains("<file targ_path=\"data/sub/level.dat\" orig_path=\"data/sub/level.dat\"/>"));

        // Nested dirs render as a tree; "sub" only appears under "data".
        assert!(xml.contains("<dir targ_name=\"data\">"));
        assert!(xml.contains("<dir targ_name=\"sub\"/>"));
        assert!(!xml.contains("entitlement_key"));
    }

    #[test]
    fn entitlement_key_is_rendered_when_present() {
        let mut project = Gp4Project::new(VolumeType::AcData, "id", "");
        project.entitlement_key = Some("00112233445566778899aabbccddeeff".into());

        assert!(
            project
                .to_xml()
                .contains("entitlement_key=\"00112233445566778899aabbccddeeff\"")
        );
    }

    #[test]
    fn add_dir_is_idempotent() {
        let mut project = Gp4Project::new(VolumeType::App, "id", "");
        project.add_dir("a/b");
        project.add_dir("a");
        project.add_dir("a/b/c");

        assert_eq!(project.root_dirs().len(), 1);
        let a = &project.root_dirs()[0];
        assert_eq!(a.children.len(), 1);
        assert_eq!(a.children[0].children.len(), 1);
    }

    #[test]
    fn attribute_values_are_escaped() {
        let mut project = Gp4Project::new(VolumeType::App, "id", "");
        project.add_file("odd \"name\" & more.dat");

        let xml = project.to_xml();
        assert!(xml.contains("odd &quot;name&quot; &amp; more.dat"));
    }
}
