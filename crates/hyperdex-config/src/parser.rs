//! Line-oriented configuration parser.
//!
//! The coordinator streams one directive per line; the link layer
//! accumulates lines until the end-of-configuration sentinel and hands
//! the whole text here. Parsing is all-or-nothing: the first error
//! poisons the pending configuration and the previous one stays in
//! force.
//!
//! Directives, whitespace-separated:
//!
//! ```text
//! version  <uint64>
//! host     <host-id> <ip> <in_port> <in_epoch> <out_port> <out_epoch>
//! space    <space-id> <name> [<attr_name> <attr_type>]...
//! subspace <space-id> <subspace-id> [<repl_bool> <disk_bool>]...
//! region   <space-id> <subspace-id> <prefix> <mask-hex> <host-id>...
//! transfer <xfer_id> <space-id> <subspace-id> <prefix> <mask-hex> <host-id>
//! quiesce  <state_id>
//! shutdown
//! ```
//!
//! Region masks are hexadecimal; every other number is decimal. The
//! `subspace` directive carries one `<repl_bool> <disk_bool>` pair per
//! attribute, key included, and may not hash unsearchable attributes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::str::FromStr;

use hyperdex_types::{AttributeType, EntityId, Instance, RegionId, SpaceId, SubspaceId};

use crate::{Attribute, ConfigParseError, Configuration, SubspaceHashing};

/// Parses a full configuration text.
pub fn parse(text: &str) -> Result<Configuration, ConfigParseError> {
    let mut p = Parser::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        p.parse_line(line)?;
    }

    Ok(p.generate(text))
}

#[derive(Default)]
struct Parser {
    version: Option<u64>,
    hosts: HashMap<u64, Instance>,
    space_ids: HashMap<String, SpaceId>,
    spaces: HashMap<SpaceId, Vec<Attribute>>,
    subspaces: HashMap<SubspaceId, SubspaceHashing>,
    subspace_counts: HashMap<SpaceId, u16>,
    regions: BTreeSet<RegionId>,
    entities: BTreeMap<EntityId, Instance>,
    transfers: HashMap<u16, (RegionId, Instance)>,
    quiesce_state_id: Option<String>,
    shutdown: bool,
}

impl Parser {
    fn parse_line(&mut self, line: &str) -> Result<(), ConfigParseError> {
        let mut tokens = line.split_whitespace();
        let directive = tokens.next().expect("line is non-empty");
        let rest: Vec<&str> = tokens.collect();

        match directive {
            "version" => self.parse_version(&rest),
            "host" => self.parse_host(&rest),
            "space" => self.parse_space(&rest),
            "subspace" => self.parse_subspace(&rest),
            "region" => self.parse_region(&rest),
            "transfer" => self.parse_transfer(&rest),
            "quiesce" => self.parse_quiesce(&rest),
            "shutdown" => self.parse_shutdown(&rest),
            other => Err(ConfigParseError::UnknownDirective(other.to_string())),
        }
    }

    fn parse_version(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        let [v] = fields else {
            return Err(bad_arity("version", fields, 1));
        };
        if self.version.is_some() {
            return Err(ConfigParseError::DupeVersion);
        }
        self.version = Some(number(v)?);
        Ok(())
    }

    fn parse_host(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        let [id, ip, in_port, in_epoch, out_port, out_epoch] = fields else {
            return Err(bad_arity("host", fields, 6));
        };
        let id: u64 = number(id)?;
        if self.hosts.contains_key(&id) {
            return Err(ConfigParseError::DupeHost(id));
        }
        let addr =
            IpAddr::from_str(ip).map_err(|_| ConfigParseError::BadIp((*ip).to_string()))?;
        let inst = Instance::new(
            addr,
            number(in_port)?,
            number(in_epoch)?,
            number(out_port)?,
            number(out_epoch)?,
        );
        self.hosts.insert(id, inst);
        Ok(())
    }

    fn parse_space(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        if fields.len() < 4 || fields.len() % 2 != 0 {
            return Err(bad_arity("space", fields, 4));
        }
        let id = SpaceId(number(fields[0])?);
        let name = fields[1];
        if self.spaces.contains_key(&id) || self.space_ids.contains_key(name) {
            return Err(ConfigParseError::DupeSpace(name.to_string()));
        }

        let mut attrs = Vec::new();
        for pair in fields[2..].chunks(2) {
            let attr_name = pair[0];
            if attrs.iter().any(|a: &Attribute| a.name == attr_name) {
                return Err(ConfigParseError::DupeAttr(attr_name.to_string()));
            }
            let ty = AttributeType::from_token(pair[1])
                .ok_or_else(|| ConfigParseError::UnknownType(pair[1].to_string()))?;
            attrs.push(Attribute { name: attr_name.to_string(), ty });
        }

        self.space_ids.insert(name.to_string(), id);
        self.spaces.insert(id, attrs);
        Ok(())
    }

    fn parse_subspace(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        if fields.len() < 4 {
            return Err(bad_arity("subspace", fields, 4));
        }
        let space = SpaceId(number(fields[0])?);
        let subspace: u16 = number(fields[1])?;
        let attrs = self
            .spaces
            .get(&space)
            .ok_or(ConfigParseError::UnknownSpace(space.0))?;

        let id = SubspaceId::new(space, subspace);
        if self.subspaces.contains_key(&id) {
            return Err(ConfigParseError::DupeSubspace(subspace));
        }
        // Subspaces of a space must arrive 0, 1, 2, ...
        if subspace != self.subspace_counts.get(&space).copied().unwrap_or(0) {
            return Err(ConfigParseError::OutOfOrderSubspace);
        }

        let pairs = &fields[2..];
        if pairs.len() != attrs.len() * 2 {
            return Err(bad_arity("subspace", fields, 2 + attrs.len() * 2));
        }

        let mut hashing = SubspaceHashing::default();
        for (attr, pair) in attrs.iter().zip(pairs.chunks(2)) {
            let repl = boolean(pair[0])?;
            let disk = boolean(pair[1])?;
            if (repl || disk) && !attr.ty.is_searchable() {
                return Err(ConfigParseError::AttrNotSearchable);
            }
            hashing.repl.push(repl);
            hashing.disk.push(disk);
        }

        self.subspaces.insert(id, hashing);
        self.subspace_counts.insert(space, subspace + 1);
        Ok(())
    }

    fn parse_region(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        if fields.len() < 5 {
            return Err(bad_arity("region", fields, 5));
        }
        let space = SpaceId(number(fields[0])?);
        let subspace: u16 = number(fields[1])?;
        if !self.subspaces.contains_key(&SubspaceId::new(space, subspace)) {
            return Err(ConfigParseError::UnknownSubspace(subspace));
        }

        let prefix: u8 = number(fields[2])?;
        let mask = hex_number(fields[3])?;
        let region = RegionId::new(space, subspace, prefix, mask);
        if self.regions.contains(&region) {
            return Err(ConfigParseError::DupeRegion);
        }

        for (idx, host_tok) in fields[4..].iter().enumerate() {
            let host_id: u64 = number(host_tok)?;
            let inst = self
                .hosts
                .get(&host_id)
                .copied()
                .ok_or(ConfigParseError::UnknownHost(host_id))?;
            self.entities.insert(EntityId::in_region(region, idx as u8), inst);
        }

        self.regions.insert(region);
        Ok(())
    }

    fn parse_transfer(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        let [xfer_id, space, subspace, prefix, mask, host_id] = fields else {
            return Err(bad_arity("transfer", fields, 6));
        };
        let xfer_id: u16 = number(xfer_id)?;
        if self.transfers.contains_key(&xfer_id) {
            return Err(ConfigParseError::DupeTransfer(xfer_id));
        }
        let region = RegionId::new(
            SpaceId(number(space)?),
            number(subspace)?,
            number(prefix)?,
            hex_number(mask)?,
        );
        if !self.regions.contains(&region) {
            return Err(ConfigParseError::UnknownRegion);
        }
        let host_id: u64 = number(host_id)?;
        let inst = self
            .hosts
            .get(&host_id)
            .copied()
            .ok_or(ConfigParseError::UnknownHost(host_id))?;
        self.transfers.insert(xfer_id, (region, inst));
        Ok(())
    }

    fn parse_quiesce(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        let [state_id] = fields else {
            return Err(bad_arity("quiesce", fields, 1));
        };
        if self.quiesce_state_id.is_some() {
            return Err(ConfigParseError::DupeQuiesce);
        }
        self.quiesce_state_id = Some((*state_id).to_string());
        Ok(())
    }

    fn parse_shutdown(&mut self, fields: &[&str]) -> Result<(), ConfigParseError> {
        if !fields.is_empty() {
            return Err(ConfigParseError::ExcessData("shutdown"));
        }
        self.shutdown = true;
        Ok(())
    }

    fn generate(self, text: &str) -> Configuration {
        let mut entities = self.entities;

        // Transfer destinations are addressable as entities in the
        // reserved transfer space, so the transfer protocol can route
        // through the ordinary logical layer.
        for (&xfer_id, &(_, inst)) in &self.transfers {
            entities.insert(EntityId::transfer(xfer_id), inst);
        }

        Configuration {
            version: self.version.unwrap_or(0),
            config_text: text.to_string(),
            hosts: self.hosts,
            space_ids: self.space_ids,
            spaces: self.spaces,
            subspaces: self.subspaces,
            subspace_counts: self.subspace_counts,
            regions: self.regions,
            entities,
            transfers: self.transfers,
            quiesce_state_id: self.quiesce_state_id,
            shutdown: self.shutdown,
        }
    }
}

fn bad_arity(
    directive: &'static str,
    fields: &[&str],
    expected: usize,
) -> ConfigParseError {
    if fields.len() < expected {
        ConfigParseError::MissingField(directive)
    } else {
        ConfigParseError::ExcessData(directive)
    }
}

fn number<T: FromStr>(token: &str) -> Result<T, ConfigParseError> {
    token
        .parse()
        .map_err(|_| ConfigParseError::BadNumber(token.to_string()))
}

fn hex_number(token: &str) -> Result<u64, ConfigParseError> {
    u64::from_str_radix(token, 16).map_err(|_| ConfigParseError::BadNumber(token.to_string()))
}

fn boolean(token: &str) -> Result<bool, ConfigParseError> {
    match token {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigParseError::BadBool(other.to_string())),
    }
}
