//! Minimal `krb5.conf` reader.
//!
//! Values are stored flat under `section|group|key` paths. Lookups are case-insensitive.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

fn can_skip_line(line: &str) -> bool {
    match line.trim_start().chars().next() {
        Some('#') | Some(';') => true, // comment line
        Some(_) => false,
        None => true, // empty line
    }
}

fn get_section_name(line: &str) -> Option<String> {
    let line = line.trim();

    if line.starts_with('[') && line.ends_with(']') && line.len() >= 2 {
        Some(line[1..line.len() - 1].to_string())
    } else {
        None
    }
}

fn try_read_line(reader: &mut impl BufRead, line: &mut String) -> bool {
    line.clear();
    if let Ok(size) = reader.read_line(line) {
        line.truncate(line.trim_end().len());
        size != 0
    } else {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Krb5Conf {
    pub values: Vec<(String, String)>,
    path: Vec<String>,
}

impl Krb5Conf {
    pub fn new_from_file(filename: &Path) -> Option<Self> {
        let file = File::open(filename).ok()?;
        let mut reader = BufReader::new(file);
        let mut config = Krb5Conf::default();
        config.parse_from_reader(&mut reader);
        Some(config)
    }

    pub fn new_from_data(data: &str) -> Self {
        let mut reader = BufReader::new(data.as_bytes());
        let mut config = Krb5Conf::default();
        config.parse_from_reader(&mut reader);
        config
    }

    /// Returns the first value stored under the path.
    pub fn get_value(&self, path: &[&str]) -> Option<String> {
        self.get_values(path).into_iter().next().map(str::to_owned)
    }

    /// Returns every value stored under the path (relations such as `kdc` may repeat).
    pub fn get_values(&self, path: &[&str]) -> Vec<&str> {
        let path = path.join("|");

        self.values
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(&path))
            .map(|(_, val)| val.as_str())
            .collect()
    }

    /// Returns `(key, value)` pairs of the section. Keys are relative to the section path.
    pub fn get_values_in_section(&self, path: &[&str]) -> Option<Vec<(&str, &str)>> {
        let prefix = format!("{}|", path.join("|").to_ascii_lowercase());

        let values = self
            .values
            .iter()
            .filter(|(key, _)| key.to_ascii_lowercase().starts_with(&prefix))
            .map(|(key, val)| (&key[prefix.len()..], val.as_str()))
            .collect::<Vec<_>>();

        if values.is_empty() {
            None
        } else {
            Some(values)
        }
    }

    fn enter_section(&mut self, name: &str) {
        self.path = vec![name.to_owned()];
    }

    fn enter_group(&mut self, name: &str) {
        self.path.truncate(1);
        self.path.push(name.to_owned());
    }

    fn current_path(&self, name: &str) -> String {
        let mut current_path = self.path.clone();
        current_path.push(name.to_owned());
        current_path.join("|")
    }

    fn parse_from_reader(&mut self, reader: &mut impl BufRead) {
        let mut line = String::new();
        let mut has_line = try_read_line(reader, &mut line);

        while has_line {
            if let Some(section_name) = get_section_name(&line) {
                has_line = self.read_section(reader, &mut line, &section_name);
            } else {
                has_line = try_read_line(reader, &mut line);
            }
        }
    }

    fn add_value(&mut self, key: &str, val: &str) {
        let path = self.current_path(key);
        self.values.push((path, val.to_owned()));
    }

    fn read_values(&mut self, reader: &mut impl BufRead, line: &mut String) {
        if let Some((lhs, _)) = line.split_once('=') {
            self.enter_group(lhs.trim());

            while try_read_line(reader, line) {
                if can_skip_line(line) {
                    continue;
                }

                if line.trim_end().ends_with('}') {
                    break;
                }

                if let Some((lhs, rhs)) = line.split_once('=') {
                    self.add_value(lhs.trim(), rhs.trim());
                }
            }

            self.path.truncate(1);
        }
    }

    /// Reads values until the next section header. Returns `false` at end of input.
    fn read_section(&mut self, reader: &mut impl BufRead, line: &mut String, name: &str) -> bool {
        self.enter_section(name);

        while try_read_line(reader, line) {
            if can_skip_line(line) {
                continue;
            }

            if get_section_name(line).is_some() {
                return true;
            }

            if line.contains('{') {
                self.read_values(reader, line);
            } else if let Some((lhs, rhs)) = line.split_once('=') {
                self.add_value(lhs.trim(), rhs.trim());
            }
        }

        false
    }
}
