use super::Hooks;
use crate::error::Result;
use crate::request::RequestTracker;
use provision_models::{Machine, Model, ModelError, Profile, Stage};

pub struct ProfileHooks;

impl Hooks<Profile> for ProfileHooks {
    fn before_delete(&self, rt: &mut RequestTracker<'_>, p: &Profile) -> Result<()> {
        let mut err = ModelError::still_in_use(p);
        for m in rt.store(Machine::PREFIX)?.iter::<Machine>() {
            if m.profiles.contains(&p.name) {
                err.push(format!("Machine {} is using profile {}", m.key(), p.name));
            }
        }
        for s in rt.store(Stage::PREFIX)?.iter::<Stage>() {
            if s.profiles.contains(&p.name) {
                err.push(format!("Stage {} is using profile {}", s.name, p.name));
            }
        }
        Ok(err.or_ok()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::locks::Action;
    use crate::testing::tracker;
    use provision_models::{Machine, Prefix, Profile};

    #[test]
    fn test_profile_in_use_by_machine() {
        let dt = tracker();
        let mut rt = dt.request_for(Prefix::Profiles, Action::Create);
        rt.do_(|rt| rt.create(Profile::new("rack1")).unwrap());

        let mut rt = dt.request_for(Prefix::Machines, Action::Create);
        let m = rt.do_(|rt| {
            let mut m = Machine::new("node1");
            m.profiles.push("rack1".to_string());
            rt.create(m).unwrap()
        });

        let mut rt = dt.request_for(Prefix::Profiles, Action::Delete);
        rt.do_(|rt| {
            let err = rt.remove::<Profile>("rack1").unwrap_err();
            assert_eq!(err.code(), 409);
            assert_eq!(
                err.model().unwrap().messages,
                vec![format!("Machine {} is using profile rack1", m.uuid)]
            );
        });
    }
}
