//! Instance labels for buses sharing a process.
//!
//! A bus's label is its self-description with the `"RebusBus "` prefix
//! removed. Resolution never fails; it falls back to [`UNKNOWN_INSTANCE`].

use crate::bus::{Bus, TransactionContext, BUS_KIND};

/// Label used when no bus name can be determined.
pub const UNKNOWN_INSTANCE: &str = "<unknown>";

/// Label for `bus`, or `None` if it is absent or describes itself as empty.
pub fn bus_name_or_none(bus: Option<&dyn Bus>) -> Option<String> {
    let description = bus?.to_string();
    if description.is_empty() {
        return None;
    }

    match description
        .strip_prefix(BUS_KIND)
        .and_then(|rest| rest.strip_prefix(' '))
    {
        Some(name) if !name.is_empty() => Some(name.to_string()),
        _ => Some(description),
    }
}

/// Label for `bus`, or `"<unknown>"`.
pub fn bus_name(bus: Option<&dyn Bus>) -> String {
    bus_name_or_none(bus).unwrap_or_else(|| UNKNOWN_INSTANCE.to_string())
}

/// Label of the bus owning `context`, if the context exposes one.
pub fn transaction_bus_name_or_none(context: Option<&dyn TransactionContext>) -> Option<String> {
    let bus = context?.as_owning_bus()?.owning_bus()?;
    bus_name_or_none(Some(bus.as_ref()))
}

/// Label of the bus owning `context`, or `"<unknown>"`.
pub fn transaction_bus_name(context: Option<&dyn TransactionContext>) -> String {
    transaction_bus_name_or_none(context).unwrap_or_else(|| UNKNOWN_INSTANCE.to_string())
}

/// Label for an operation: the configured override when set, otherwise
/// the bus owning `context`.
pub fn resolve_instance(instance_override: Option<&str>, context: &dyn TransactionContext) -> String {
    match instance_override {
        Some(name) => name.to_string(),
        None => transaction_bus_name(Some(context)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DefaultTransactionContext, MockBus};
    use std::sync::Arc;

    fn context_owned_by(bus: &Arc<dyn Bus>) -> DefaultTransactionContext {
        DefaultTransactionContext::with_owning_bus(Arc::downgrade(bus))
    }

    #[test]
    fn test_bus_name_strips_kind_prefix() {
        for (description, expected) in [
            ("RebusBus Rebus 1", "Rebus 1"),
            ("RebusBus Rebus 14", "Rebus 14"),
            ("MyCustomName", "MyCustomName"),
        ] {
            let bus = MockBus::new(description);
            assert_eq!(bus_name(Some(&bus)), expected);
            assert_eq!(bus_name_or_none(Some(&bus)).as_deref(), Some(expected));
        }
    }

    #[test]
    fn test_bare_prefix_is_kept_whole() {
        let bus = MockBus::new("RebusBus ");
        assert_eq!(bus_name(Some(&bus)), "RebusBus ");

        let bus = MockBus::new("RebusBusy");
        assert_eq!(bus_name(Some(&bus)), "RebusBusy");
    }

    #[test]
    fn test_absent_or_empty_bus_is_unknown() {
        assert_eq!(bus_name(None), UNKNOWN_INSTANCE);
        assert_eq!(bus_name_or_none(None), None);

        let bus = MockBus::new("");
        assert_eq!(bus_name(Some(&bus)), UNKNOWN_INSTANCE);
        assert_eq!(bus_name_or_none(Some(&bus)), None);
    }

    #[test]
    fn test_transaction_with_owning_bus() {
        for (description, expected) in [
            ("RebusBus Rebus 1", Some("Rebus 1")),
            ("RebusBus Rebus 14", Some("Rebus 14")),
            ("MyCustomName", Some("MyCustomName")),
            ("", None),
        ] {
            let bus: Arc<dyn Bus> = Arc::new(MockBus::new(description));
            let ctx = context_owned_by(&bus);

            assert_eq!(transaction_bus_name_or_none(Some(&ctx)).as_deref(), expected);
            assert_eq!(
                transaction_bus_name(Some(&ctx)),
                expected.unwrap_or(UNKNOWN_INSTANCE)
            );
        }
    }

    #[test]
    fn test_transaction_without_owning_bus_is_unknown() {
        let ctx = DefaultTransactionContext::new();
        assert_eq!(transaction_bus_name(Some(&ctx)), UNKNOWN_INSTANCE);
        assert_eq!(transaction_bus_name_or_none(Some(&ctx)), None);
        assert_eq!(transaction_bus_name(None), UNKNOWN_INSTANCE);
    }

    #[test]
    fn test_dropped_owning_bus_is_unknown() {
        let bus: Arc<dyn Bus> = Arc::new(MockBus::new("RebusBus gone"));
        let ctx = context_owned_by(&bus);
        drop(bus);

        assert_eq!(transaction_bus_name(Some(&ctx)), UNKNOWN_INSTANCE);
    }

    #[test]
    fn test_override_wins() {
        let bus: Arc<dyn Bus> = Arc::new(MockBus::new("RebusBus Rebus 1"));
        let ctx = context_owned_by(&bus);

        assert_eq!(resolve_instance(Some("configured"), &ctx), "configured");
        assert_eq!(resolve_instance(None, &ctx), "Rebus 1");
    }
}
