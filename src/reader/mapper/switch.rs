//! Switch mapper: lid, headphone jack and friends.

use crate::codes::{KeyState, PolicyFlags, Source};
use crate::hub::{RawEvent, RawEventKind, RawEventSource};
use crate::listener::{NotifyArgs, SwitchArgs};
use crate::reader::{DeviceContext, ReaderContext};
use crate::utils::Nanos;

/// Emits one switch notification per switch state change.
#[derive(Debug, Default)]
pub struct SwitchMapper;

impl SwitchMapper {
    pub fn new() -> Self {
        SwitchMapper
    }

    pub fn sources(&self) -> Source {
        Source::SWITCH
    }

    pub fn configure(
        &mut self,
        _ctx: &mut ReaderContext<'_>,
        _dev: &DeviceContext<'_>,
        _changes: crate::policy::ConfigChanges,
    ) {
    }

    pub fn reset(&mut self, _ctx: &mut ReaderContext<'_>, _dev: &DeviceContext<'_>, _when: Nanos) {}

    pub fn process(&mut self, ctx: &mut ReaderContext<'_>, _dev: &DeviceContext<'_>, raw: &RawEvent) {
        if raw.kind == RawEventKind::Switch {
            ctx.notify(NotifyArgs::Switch(SwitchArgs {
                when: raw.when,
                policy_flags: PolicyFlags::empty(),
                switch_code: raw.code,
                switch_value: raw.value,
            }));
        }
    }

    pub fn switch_state(
        &self,
        hub: &dyn RawEventSource,
        dev: &DeviceContext<'_>,
        switch_code: i32,
    ) -> KeyState {
        hub.switch_state(dev.id, switch_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::testing::*;

    #[test]
    fn switch_events_pass_through() {
        let mut fixture = MapperFixture::new();
        let mut mapper = SwitchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(
                ctx,
                dev,
                &RawEvent {
                    when: 10,
                    device_id: 1,
                    kind: RawEventKind::Switch,
                    code: 5,
                    value: 1,
                    flags: PolicyFlags::empty(),
                },
            );
        });
        let events = fixture.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            NotifyArgs::Switch(SwitchArgs {
                when: 10,
                policy_flags: PolicyFlags::empty(),
                switch_code: 5,
                switch_value: 1,
            })
        );
    }

    #[test]
    fn other_events_are_ignored() {
        let mut fixture = MapperFixture::new();
        let mut mapper = SwitchMapper::new();
        fixture.with_ctx(|ctx, dev| {
            mapper.process(
                ctx,
                dev,
                &RawEvent {
                    when: 10,
                    device_id: 1,
                    kind: RawEventKind::Key,
                    code: 5,
                    value: 1,
                    flags: PolicyFlags::empty(),
                },
            );
        });
        assert!(fixture.drain().is_empty());
    }
}
