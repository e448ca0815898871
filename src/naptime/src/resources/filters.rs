use crate::model::SleepSchedule;

use kube::{api::ResourceExt, Resource};

/// True when any exclusion rule matches the instance.
pub fn is_excluded<R>(resource: &R, schedule: &SleepSchedule) -> bool
where
    R: Resource,
    R::DynamicType: Default,
{
    let dt = R::DynamicType::default();
    let kind = R::kind(&dt);
    let api_version = R::api_version(&dt);
    schedule
        .exclude_refs()
        .iter()
        .any(|rule| rule.matches(&kind, &api_version, &resource.name_any(), resource.labels()))
}

/// True when the instance matches at least one inclusion rule. An empty rule
/// list includes everything.
pub fn is_included<R>(resource: &R, schedule: &SleepSchedule) -> bool
where
    R: Resource,
    R::DynamicType: Default,
{
    let rules = schedule.include_refs();
    if rules.is_empty() {
        return true;
    }
    let dt = R::DynamicType::default();
    let kind = R::kind(&dt);
    let api_version = R::api_version(&dt);
    rules
        .iter()
        .any(|rule| rule.matches(&kind, &api_version, &resource.name_any(), resource.labels()))
}

/// Exclusion is evaluated first: an excluded instance is dropped regardless
/// of the inclusion rules.
pub fn in_scope<R>(resource: &R, schedule: &SleepSchedule) -> bool
where
    R: Resource,
    R::DynamicType: Default,
{
    !is_excluded(resource, schedule) && is_included(resource, schedule)
}
