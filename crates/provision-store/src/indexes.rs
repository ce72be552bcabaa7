//! Field indexes declared for each model

use crate::index::{Indexed, Maker};
use chrono::{DateTime, Utc};
use provision_models::{
    BootEnv, Job, JobState, Lease, Machine, Profile, Reservation, Stage, Subnet, Task,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

fn parse_addr(s: &str) -> Result<Ipv4Addr, String> {
    s.parse::<Ipv4Addr>().map_err(|e| e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, String> {
    s.parse::<Uuid>().map_err(|e| e.to_string())
}

fn name_index<T: 'static>(
    get: fn(&T) -> &str,
    make: fn(&str) -> T,
    unique: bool,
) -> Maker<T> {
    Maker::new(
        "string",
        unique,
        move |a: &T, b: &T| get(a) < get(b),
        move |s: &str| Ok(make(s)),
    )
}

impl Indexed for Lease {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        let blank = |addr| Lease::new(addr, "", "");
        BTreeMap::from([
            (
                "Addr",
                Maker::new(
                    "IP Address",
                    true,
                    |a: &Lease, b: &Lease| a.addr < b.addr,
                    move |s: &str| parse_addr(s).map(blank),
                ),
            ),
            (
                "Token",
                name_index(
                    |l: &Lease| l.token.as_str(),
                    |s| Lease::new(Ipv4Addr::UNSPECIFIED, "", s),
                    false,
                ),
            ),
            (
                "Strategy",
                name_index(
                    |l: &Lease| l.strategy.as_str(),
                    |s| Lease::new(Ipv4Addr::UNSPECIFIED, s, ""),
                    false,
                ),
            ),
            (
                "ExpireTime",
                Maker::new(
                    "Date/Time",
                    false,
                    |a: &Lease, b: &Lease| a.expire_time < b.expire_time,
                    |s: &str| {
                        let t = s
                            .parse::<DateTime<Utc>>()
                            .map_err(|e| format!("ExpireTime is not valid: {}", e))?;
                        let mut l = Lease::new(Ipv4Addr::UNSPECIFIED, "", "");
                        l.expire_time = t;
                        Ok(l)
                    },
                ),
            ),
        ])
    }
}

impl Indexed for Reservation {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([
            (
                "Addr",
                Maker::new(
                    "IP Address",
                    true,
                    |a: &Reservation, b: &Reservation| a.addr < b.addr,
                    |s: &str| parse_addr(s).map(|a| Reservation::new(a, "", "")),
                ),
            ),
            (
                "Token",
                name_index(
                    |r: &Reservation| r.token.as_str(),
                    |s| Reservation::new(Ipv4Addr::UNSPECIFIED, "", s),
                    false,
                ),
            ),
        ])
    }
}

impl Indexed for Subnet {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        let blank = |name: &str| {
            Subnet::new(name, "", Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
        };
        BTreeMap::from([
            ("Name", name_index(|s: &Subnet| s.name.as_str(), blank, true)),
            (
                "Strategy",
                name_index(
                    |s: &Subnet| s.strategy.as_str(),
                    |v| {
                        let mut s = Subnet::new("", "", Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
                        s.strategy = v.to_string();
                        s
                    },
                    false,
                ),
            ),
        ])
    }
}

impl Indexed for Machine {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([
            (
                "Uuid",
                Maker::new(
                    "UUID",
                    true,
                    |a: &Machine, b: &Machine| a.uuid < b.uuid,
                    |s: &str| {
                        let mut m = Machine::new("");
                        m.uuid = parse_uuid(s)?;
                        Ok(m)
                    },
                ),
            ),
            ("Name", name_index(|m: &Machine| m.name.as_str(), |s: &str| Machine::new(s), true)),
            (
                "BootEnv",
                name_index(
                    |m: &Machine| m.boot_env.as_str(),
                    |s| {
                        let mut m = Machine::new("");
                        m.boot_env = s.to_string();
                        m
                    },
                    false,
                ),
            ),
            (
                "Stage",
                name_index(
                    |m: &Machine| m.stage.as_str(),
                    |s| {
                        let mut m = Machine::new("");
                        m.stage = s.to_string();
                        m
                    },
                    false,
                ),
            ),
            (
                "Address",
                Maker::new(
                    "IP Address",
                    false,
                    |a: &Machine, b: &Machine| a.address < b.address,
                    |s: &str| {
                        let mut m = Machine::new("");
                        m.address = Some(parse_addr(s)?);
                        Ok(m)
                    },
                ),
            ),
        ])
    }
}

impl Indexed for BootEnv {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([(
            "Name",
            name_index(|b: &BootEnv| b.name.as_str(), |s: &str| BootEnv::new(s), true),
        )])
    }
}

impl Indexed for Stage {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([
            ("Name", name_index(|s: &Stage| s.name.as_str(), |s: &str| Stage::new(s), true)),
            (
                "BootEnv",
                name_index(
                    |s: &Stage| s.boot_env.as_str(),
                    |v| {
                        let mut s = Stage::new("");
                        s.boot_env = v.to_string();
                        s
                    },
                    false,
                ),
            ),
        ])
    }
}

impl Indexed for Task {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([("Name", name_index(|t: &Task| t.name.as_str(), |s: &str| Task::new(s), true))])
    }
}

impl Indexed for Profile {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([(
            "Name",
            name_index(|p: &Profile| p.name.as_str(), |s: &str| Profile::new(s), true),
        )])
    }
}

impl Indexed for Job {
    fn indexes() -> BTreeMap<&'static str, Maker<Self>> {
        BTreeMap::from([
            (
                "Uuid",
                Maker::new(
                    "UUID",
                    true,
                    |a: &Job, b: &Job| a.uuid < b.uuid,
                    |s: &str| {
                        let mut j = Job::new(Uuid::nil(), "", "");
                        j.uuid = parse_uuid(s)?;
                        Ok(j)
                    },
                ),
            ),
            (
                "Machine",
                Maker::new(
                    "UUID",
                    false,
                    |a: &Job, b: &Job| a.machine < b.machine,
                    |s: &str| Ok(Job::new(parse_uuid(s)?, "", "")),
                ),
            ),
            (
                "State",
                Maker::new(
                    "string",
                    false,
                    |a: &Job, b: &Job| a.state.as_str() < b.state.as_str(),
                    |s: &str| {
                        let state: JobState = serde_json::from_value(serde_json::Value::from(s))
                            .map_err(|e| e.to_string())?;
                        let mut j = Job::new(Uuid::nil(), "", "");
                        j.state = state;
                        Ok(j)
                    },
                ),
            ),
        ])
    }
}
