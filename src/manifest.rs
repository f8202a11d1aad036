//! Program manifest (`MasterConfig.cfg`, `MasterInput.cfg`)
//!
//! INI files with `[section]` headers and `name = value` options (`:` also
//! accepted). Option names are case-insensitive. Values may reference other
//! options as `${option}` (same section, then `[DEFAULT]`) or
//! `${section:option}`; `$$` is a literal `$`. Raw values are kept as written
//! so a rewrite preserves every reference.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

/// Name of the fallback section
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Manifest location inside a program workspace
pub const PROGRAM_MANIFEST: &str = "config/MasterConfig.cfg";

/// Manifest at the root of a bulk input archive
pub const MASTER_INPUT_MANIFEST: &str = "MasterInput.cfg";

const MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
struct Section {
    name: String,
    options: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            options: Vec::new(),
        }
    }

    fn raw(&self, option: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == option)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed manifest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    defaults: Section,
    sections: Vec<Section>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())
            .with_context(|| format!("Failed to write manifest {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut manifest = Manifest {
            defaults: Section::new(DEFAULT_SECTION),
            sections: Vec::new(),
        };
        // (is default section, index) of the section being filled
        let mut current: Option<Option<usize>> = None;
        let mut last_option: Option<String> = None;

        for (i, raw_line) in content.lines().enumerate() {
            let line_no = i + 1;
            let line = raw_line.trim_end_matches('\r');
            let trimmed = line.trim();

            if trimmed.is_empty() {
                last_option = None;
                continue;
            }
            if trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            let indented = line.starts_with(char::is_whitespace);
            if indented {
                if let (Some(section), Some(option)) = (current, &last_option) {
                    let section = manifest.section_slot(section);
                    if let Some((_, value)) = section.options.iter_mut().find(|(k, _)| k == option) {
                        value.push('\n');
                        value.push_str(trimmed);
                        continue;
                    }
                }
            }

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                let name = trimmed[1..trimmed.len() - 1].trim();
                if name == DEFAULT_SECTION {
                    current = Some(None);
                } else {
                    if manifest.sections.iter().any(|s| s.name == name) {
                        bail!("line {}: duplicate section [{}]", line_no, name);
                    }
                    manifest.sections.push(Section::new(name));
                    current = Some(Some(manifest.sections.len() - 1));
                }
                last_option = None;
                continue;
            }

            let section = current
                .ok_or_else(|| anyhow!("line {}: option outside of any section", line_no))?;
            let delimiter = trimmed
                .find(['=', ':'])
                .ok_or_else(|| anyhow!("line {}: expected `name = value`", line_no))?;
            let key = trimmed[..delimiter].trim().to_lowercase();
            let value = trimmed[delimiter + 1..].trim().to_string();
            if key.is_empty() {
                bail!("line {}: empty option name", line_no);
            }

            let slot = manifest.section_slot(section);
            if slot.raw(&key).is_some() {
                bail!("line {}: duplicate option {} in [{}]", line_no, key, slot.name);
            }
            slot.options.push((key.clone(), value));
            last_option = Some(key);
        }

        Ok(manifest)
    }

    fn section_slot(&mut self, slot: Option<usize>) -> &mut Section {
        match slot {
            Some(i) => &mut self.sections[i],
            None => &mut self.defaults,
        }
    }

    fn section(&self, name: &str) -> Option<&Section> {
        if name == DEFAULT_SECTION {
            return Some(&self.defaults);
        }
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name == name)
    }

    /// Option names declared in `section`, in file order
    pub fn options(&self, section: &str) -> Vec<String> {
        self.section(section)
            .map(|s| s.options.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    /// Value as written, falling back to `[DEFAULT]`
    pub fn get_raw(&self, section: &str, option: &str) -> Option<&str> {
        let option = option.to_lowercase();
        self.section(section)
            .and_then(|s| s.raw(&option))
            .or_else(|| self.defaults.raw(&option))
    }

    /// Interpolated value
    pub fn get(&self, section: &str, option: &str) -> Result<Option<String>> {
        match self.get_raw(section, option) {
            Some(raw) => self.interpolate(section, option, raw, 1).map(Some),
            None => Ok(None),
        }
    }

    /// Interpolated `(option, value)` pairs of a section
    pub fn items(&self, section: &str) -> Result<Vec<(String, String)>> {
        self.options(section)
            .into_iter()
            .map(|option| {
                let value = self.get(section, &option)?.unwrap_or_default();
                Ok((option, value))
            })
            .collect()
    }

    /// Drop every `[DEFAULT]` option
    pub fn clear_defaults(&mut self) {
        self.defaults.options.clear();
    }

    /// Set a literal value; `$` is escaped so it is not interpolated
    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        let option = option.to_lowercase();
        let value = value.replace('$', "$$");
        let slot = if section == DEFAULT_SECTION {
            &mut self.defaults
        } else {
            match self.sections.iter().position(|s| s.name == section) {
                Some(i) => &mut self.sections[i],
                None => {
                    self.sections.push(Section::new(section));
                    let last = self.sections.len() - 1;
                    &mut self.sections[last]
                }
            }
        };

        match slot.options.iter_mut().find(|(k, _)| *k == option) {
            Some((_, existing)) => *existing = value,
            None => slot.options.push((option, value)),
        }
    }

    fn interpolate(&self, section: &str, option: &str, raw: &str, depth: usize) -> Result<String> {
        if depth > MAX_DEPTH {
            bail!(
                "interpolation too deep in [{}] {} (circular reference?)",
                section,
                option
            );
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(at) = rest.find('$') {
            out.push_str(&rest[..at]);
            let after = &rest[at + 1..];
            if let Some(tail) = after.strip_prefix('$') {
                out.push('$');
                rest = tail;
            } else if let Some(body) = after.strip_prefix('{') {
                let end = body
                    .find('}')
                    .ok_or_else(|| anyhow!("unterminated reference in [{}] {}", section, option))?;
                let reference = &body[..end];
                let (ref_section, ref_option) = match reference.split_once(':') {
                    Some((s, o)) => (s, o),
                    None => (section, reference),
                };
                let value = self.get_raw(ref_section, ref_option).ok_or_else(|| {
                    anyhow!(
                        "[{}] {} references missing option {}",
                        section,
                        option,
                        reference
                    )
                })?;
                out.push_str(&self.interpolate(ref_section, ref_option, value, depth + 1)?);
                rest = &body[end + 1..];
            } else {
                bail!("bad `$` in [{}] {}: use `$$` for a literal", section, option);
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl std::fmt::Display for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::new();
        let sections = std::iter::once(&self.defaults)
            .filter(|d| !d.options.is_empty())
            .chain(self.sections.iter());
        for section in sections {
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.options {
                let _ = writeln!(out, "{} = {}", key, value.replace('\n', "\n\t"));
            }
            out.push('\n');
        }
        f.write_str(&out)
    }
}
