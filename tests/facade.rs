//! Integration tests for the capability facade against the simulated instrument
//!
//! These tests verify that `VicpOscilloscope` implements the capability
//! traits correctly: the configuration cache answers without I/O, the trigger
//! state machine follows the instrument, and waveforms come back whole.

use std::sync::Arc;
use std::thread;
use vicp_scope::cache::{CacheKey, CachedValue, ChannelField};
use vicp_scope::capabilities::{
    Acquisition, ChannelControl, Generation, MeterMode, Metering, TriggerState, TriggerType,
    WaveShape,
};
use vicp_scope::config::VicpConfig;
use vicp_scope::error::VicpError;
use vicp_scope::instrument::simulated::digital_level;
use vicp_scope::instrument::{Acquired, CouplingType, SimulatedScope, VicpOscilloscope};

fn connect(sim: &SimulatedScope) -> VicpOscilloscope {
    VicpOscilloscope::from_transport(Box::new(sim.clone()), &VicpConfig::default()).unwrap()
}

fn trigger_and_download(scope: &VicpOscilloscope, sim: &SimulatedScope, to_queue: bool) -> Acquired {
    scope.start_single_trigger().unwrap();
    sim.fire_trigger();
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Triggered);
    scope.acquire_data(to_queue).unwrap()
}

// =============================================================================
// Connection setup
// =============================================================================

#[test]
fn connection_setup_detects_channels_and_options() {
    let sim = SimulatedScope::new("WS3024").with_options(&["DVM", "AFG", "I2C"]);
    let scope = connect(&sim);

    assert_eq!(scope.identity().model, "WS3024");
    assert_eq!(scope.roster().analog_count(), 4);
    // Four analog inputs plus the external trigger
    assert_eq!(scope.channel_count(), 5);
    assert_eq!(scope.meter_channel_count(), 4);
    assert_eq!(scope.generator_channel_count(), 1);

    let commands = sim.commands();
    assert_eq!(commands[0], "CHDR OFF");
    assert_eq!(commands[1], "*IDN?");
    assert_eq!(commands[2], "*OPT?");
    assert!(commands.contains(&"VBS 'app.acquisition.DVM.AutoRange = 0'".to_string()));
    assert_eq!(sim.command_count("COMM_FORMAT DEF9,BYTE,BIN"), 1);
    assert_eq!(sim.command_count("INR?"), 1);
}

#[test]
fn logic_probe_adds_sixteen_digital_channels() {
    let sim = SimulatedScope::new("WS3024")
        .with_options(&["MSXX"])
        .with_logic_probe("1100000000000000");
    let scope = connect(&sim);

    assert_eq!(scope.roster().digital_count(), 16);
    assert_eq!(scope.channel_count(), 4 + 1 + 16);

    let external = scope.roster().external_trigger_index();
    assert!(!scope.is_channel_enabled(external).unwrap());

    // Line selection is read once at connection time
    let d0 = scope.roster().by_hw_name("D0").unwrap().index;
    let d1 = scope.roster().by_hw_name("D1").unwrap().index;
    let d3 = scope.roster().by_hw_name("D3").unwrap().index;
    assert!(scope.is_channel_enabled(d0).unwrap());
    assert!(scope.is_channel_enabled(d1).unwrap());
    assert!(!scope.is_channel_enabled(d3).unwrap());
    assert_eq!(sim.command_count("Digital1:WF?"), 1);

    assert_eq!(scope.channel_coupling(d3).unwrap(), CouplingType::Synthetic);
    assert!(matches!(scope.enable_channel(d3), Err(VicpError::Unsupported(_))));
}

#[test]
fn digital_selection_changes_appear_after_flush() {
    let sim = SimulatedScope::new("WS3024")
        .with_options(&["MSXX"])
        .with_logic_probe("1000000000000000");
    let scope = connect(&sim);
    let d0 = scope.roster().by_hw_name("D0").unwrap().index;
    let d5 = scope.roster().by_hw_name("D5").unwrap().index;

    sim.set_selected_lines("0000010000000000");
    assert!(scope.is_channel_enabled(d0).unwrap());

    scope.flush_config_cache();
    assert!(!scope.is_channel_enabled(d0).unwrap());
    assert!(scope.is_channel_enabled(d5).unwrap());
    // One query refreshed all sixteen lines
    assert_eq!(sim.command_count("Digital1:WF?"), 2);
}

#[test]
fn idle_logic_probe_adds_nothing() {
    let sim = SimulatedScope::new("WS3024")
        .with_options(&["MSXX"])
        .with_logic_probe("0000000000000000");
    let scope = connect(&sim);
    assert_eq!(scope.roster().digital_count(), 0);
}

#[test]
fn high_definition_models_transfer_words() {
    let sim = SimulatedScope::new("HDO6104").with_capture(1, 50);
    let scope = connect(&sim);
    assert_eq!(sim.command_count("COMM_FORMAT DEF9,WORD,BIN"), 1);

    let Acquired::Returned(set) = trigger_and_download(&scope, &sim, false) else {
        panic!("expected a returned set");
    };
    let waveform = set.get(0).unwrap();
    assert_eq!(waveform.bytes_per_sample, 2);
    assert_eq!(waveform.samples.len(), 100);
    assert_eq!(waveform.len(), 50);
}

// =============================================================================
// Configuration cache
// =============================================================================

#[test]
fn voltage_range_setter_is_cached_until_flushed() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    scope.set_voltage_range(0, 2.5).unwrap();
    assert_eq!(sim.command_count("C1:VOLT_DIV 3.125E-1"), 1);

    let entry = scope
        .cache()
        .get(CacheKey::Channel(0, ChannelField::VoltageRange))
        .unwrap();
    assert!(entry.valid);
    assert_eq!(entry.value, CachedValue::Real(2.5));

    assert_eq!(scope.voltage_range(0).unwrap(), 2.5);
    assert_eq!(sim.command_count("C1:VOLT_DIV?"), 0);

    scope.flush_config_cache();
    assert!(!scope
        .cache()
        .get(CacheKey::Channel(0, ChannelField::VoltageRange))
        .unwrap()
        .valid);

    assert_eq!(scope.voltage_range(0).unwrap(), 2.5);
    assert_eq!(sim.command_count("C1:VOLT_DIV?"), 1);
    assert_eq!(scope.voltage_range(0).unwrap(), 2.5);
    assert_eq!(sim.command_count("C1:VOLT_DIV?"), 1);
}

#[test]
fn small_settings_are_cached_as_the_instrument_holds_them() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    scope.set_voltage_range(0, 0.01).unwrap();
    scope.set_channel_offset(0, 4e-5).unwrap();
    scope.set_trigger_level(4e-4).unwrap();
    assert_eq!(sim.command_count("C1:VOLT_DIV 1.25E-3"), 1);
    assert_eq!(sim.command_count("C1:OFFSET 4E-5"), 1);
    assert_eq!(sim.command_count("C1:TRLV 4E-4 V"), 1);

    let cached = (
        scope.voltage_range(0).unwrap(),
        scope.channel_offset(0).unwrap(),
        scope.trigger_level().unwrap(),
    );
    assert_eq!(cached, (0.01, 4e-5, 4e-4));
    assert_eq!(sim.volt_div(0), Some(0.01 / 8.0));
    assert_eq!(sim.offset(0), Some(4e-5));
    assert_eq!(sim.trigger_level(), 4e-4);

    scope.flush_config_cache();
    let from_device = (
        scope.voltage_range(0).unwrap(),
        scope.channel_offset(0).unwrap(),
        scope.trigger_level().unwrap(),
    );
    assert_eq!(from_device, cached);
}

#[test]
fn concurrent_setter_and_cache_miss_agree_with_the_instrument() {
    let sim = SimulatedScope::new("WS3024").with_response_chunk(3);
    let scope = Arc::new(connect(&sim));
    let key = CacheKey::Channel(0, ChannelField::VoltageRange);

    let writer = {
        let scope = Arc::clone(&scope);
        thread::spawn(move || {
            for i in 1..=200 {
                scope.set_voltage_range(0, i as f64 * 0.08).unwrap();
            }
        })
    };
    let reader = {
        let scope = Arc::clone(&scope);
        let sim = sim.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                scope.flush_config_cache();
                scope.voltage_range(0).unwrap();
                // A valid entry always matches the instrument
                let _link = scope.session().lock();
                if let Some(value) = scope.cache().get_valid(key) {
                    assert_eq!(value, CachedValue::Real(sim.volt_div(0).unwrap() * 8.0));
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(sim.volt_div(0), Some(2.0));
    assert_eq!(scope.voltage_range(0).unwrap(), 16.0);
    scope.flush_config_cache();
    assert_eq!(scope.voltage_range(0).unwrap(), 16.0);
}

#[test]
fn front_panel_changes_appear_after_flush() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    assert_eq!(scope.voltage_range(1).unwrap(), 0.8);
    sim.set_volt_div(1, 1.0);
    assert_eq!(scope.voltage_range(1).unwrap(), 0.8);

    scope.flush_config_cache();
    assert_eq!(scope.voltage_range(1).unwrap(), 8.0);
}

#[test]
fn channel_settings_round_trip_through_the_instrument() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    scope.set_channel_coupling(2, CouplingType::Ac1M).unwrap();
    scope.set_channel_attenuation(2, 10.0).unwrap();
    scope.set_channel_bandwidth_limit(2, 200).unwrap();
    scope.set_channel_offset(2, -0.125).unwrap();
    scope.disable_channel(3).unwrap();
    scope.flush_config_cache();

    assert_eq!(scope.channel_coupling(2).unwrap(), CouplingType::Ac1M);
    assert_eq!(scope.channel_attenuation(2).unwrap(), 10.0);
    assert_eq!(scope.channel_bandwidth_limit(2).unwrap(), 200);
    assert_eq!(scope.channel_bandwidth_limit(0).unwrap(), 0);
    assert_eq!(scope.channel_offset(2).unwrap(), -0.125);
    assert!(!scope.is_channel_enabled(3).unwrap());
    assert!(scope.is_channel_enabled(0).unwrap());
}

#[test]
fn out_of_roster_channels_are_rejected() {
    let sim = SimulatedScope::new("WS3022");
    let scope = connect(&sim);

    assert!(matches!(scope.voltage_range(9), Err(VicpError::InvalidChannel(9))));
    assert!(matches!(
        scope.set_voltage_range(9, 1.0),
        Err(VicpError::InvalidChannel(9))
    ));
    // The external trigger has no vertical settings
    let external = scope.roster().external_trigger_index();
    assert!(scope.set_voltage_range(external, 1.0).is_err());
}

#[test]
fn bulk_enable_check_pipelines_every_channel() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);
    sim.set_trace(2, false);

    scope.bulk_check_channel_enable_state().unwrap();
    for channel in 1..=4 {
        assert_eq!(sim.command_count(&format!("C{}:TRACE?", channel)), 1);
    }
    assert!(!scope.is_channel_enabled(2).unwrap());

    // Everything is cached now
    scope.bulk_check_channel_enable_state().unwrap();
    assert_eq!(sim.commands_starting_with("C1:TRACE?"), 1);
}

// =============================================================================
// Trigger and acquisition
// =============================================================================

#[test]
fn single_shot_returns_to_idle_after_download() {
    let sim = SimulatedScope::new("WS3024").with_response_chunk(7);
    let scope = connect(&sim);
    assert_eq!(scope.trigger_state(), TriggerState::Idle);

    scope.start_single_trigger().unwrap();
    assert_eq!(scope.trigger_state(), TriggerState::Armed);
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Armed);
    assert!(scope.is_trigger_armed());

    sim.fire_trigger();
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Triggered);
    // Triggered is sticky until the data is read
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Triggered);

    let Acquired::Returned(set) = scope.acquire_data(false).unwrap() else {
        panic!("expected a returned set");
    };
    assert_eq!(set.len(), 4);
    let c2 = set.get(1).unwrap();
    assert_eq!(c2.len(), 100);
    assert_eq!(c2.samples[0], 16);
    assert_eq!(c2.descriptor.vertical_gain, 0.01);
    assert_eq!(c2.trigger_delta, None);

    assert_eq!(scope.trigger_state(), TriggerState::Idle);
    assert!(!scope.is_trigger_armed());
    assert_eq!(sim.command_count("TRIG_MODE SINGLE"), 1);
    assert_eq!(sim.unread(), 0);
}

#[test]
fn continuous_mode_rearms_after_download() {
    let sim = SimulatedScope::new("WS3022");
    let scope = connect(&sim);

    scope.start().unwrap();
    sim.fire_trigger();
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Triggered);
    assert!(matches!(scope.acquire_data(false).unwrap(), Acquired::Returned(_)));

    assert_eq!(scope.trigger_state(), TriggerState::Armed);
    assert_eq!(sim.command_count("TRIG_MODE SINGLE"), 2);
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Armed);

    scope.stop().unwrap();
    assert_eq!(scope.trigger_state(), TriggerState::Idle);
    assert_eq!(sim.command_count("TRIG_MODE STOP"), 1);
}

#[test]
fn segmented_capture_queues_the_remaining_segments() {
    let sim = SimulatedScope::new("WS3024").with_capture(3, 10);
    let scope = connect(&sim);
    for channel in 1..4 {
        scope.disable_channel(channel).unwrap();
    }

    let Acquired::Returned(first) = trigger_and_download(&scope, &sim, false) else {
        panic!("expected a returned set");
    };
    assert_eq!(sim.command_count("C1:WF? TIME"), 1);
    assert_eq!(sim.command_count("C2:WF? DAT1"), 0);

    assert_eq!(first.len(), 1);
    let waveform = first.get(0).unwrap();
    assert_eq!(waveform.segment, 0);
    assert_eq!(waveform.len(), 10);
    assert_eq!(waveform.trigger_delta, Some(0.0));

    assert_eq!(scope.pending_waveform_count(), 2);
    let rest = scope.pop_pending_waveforms();
    assert_eq!(rest.len(), 2);
    let second = rest[0].get(0).unwrap();
    assert_eq!(second.segment, 1);
    assert_eq!(second.samples[0], 10);
    assert_eq!(second.trigger_delta, Some(1e-3));
    assert_eq!(rest[1].get(0).unwrap().trigger_delta, Some(2e-3));
    assert_eq!(scope.pending_waveform_count(), 0);
}

#[test]
fn queued_download_is_cleared_by_stop() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    assert_eq!(
        trigger_and_download(&scope, &sim, true),
        Acquired::Queued { sets: 1 }
    );
    assert_eq!(scope.pending_waveform_count(), 1);

    scope.stop().unwrap();
    assert_eq!(scope.pending_waveform_count(), 0);
}

#[test]
fn queue_keeps_the_newest_sets_when_full() {
    let sim = SimulatedScope::new("WS3022").with_capture(5, 4);
    let mut config = VicpConfig::default();
    config.acquisition.queue_capacity = 2;
    let scope = VicpOscilloscope::from_transport(Box::new(sim.clone()), &config).unwrap();

    assert_eq!(
        trigger_and_download(&scope, &sim, true),
        Acquired::Queued { sets: 5 }
    );
    let kept: Vec<_> = scope
        .pop_pending_waveforms()
        .iter()
        .map(|set| set.get(0).unwrap().segment)
        .collect();
    assert_eq!(kept, vec![3, 4]);
}

#[test]
fn nothing_is_downloaded_without_enabled_channels() {
    let sim = SimulatedScope::new("WS3022");
    let scope = connect(&sim);
    scope.disable_channel(0).unwrap();
    scope.disable_channel(1).unwrap();

    assert_eq!(
        trigger_and_download(&scope, &sim, false),
        Acquired::NoEnabledChannels
    );
    assert_eq!(sim.commands_starting_with("C1:WF?"), 0);
    // The single shot is still consumed
    assert_eq!(scope.trigger_state(), TriggerState::Idle);
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Idle);
}

#[test]
fn continuous_mode_rearms_without_enabled_channels() {
    let sim = SimulatedScope::new("WS3022");
    let scope = connect(&sim);
    scope.disable_channel(0).unwrap();
    scope.disable_channel(1).unwrap();

    scope.start().unwrap();
    sim.fire_trigger();
    assert_eq!(scope.poll_trigger().unwrap(), TriggerState::Triggered);
    assert_eq!(scope.acquire_data(false).unwrap(), Acquired::NoEnabledChannels);

    assert_eq!(scope.trigger_state(), TriggerState::Armed);
    assert_eq!(sim.command_count("TRIG_MODE SINGLE"), 2);
}

#[test]
fn selected_logic_lines_are_downloaded_with_the_analog_channels() {
    let sim = SimulatedScope::new("WS3022")
        .with_options(&["MSXX"])
        .with_logic_probe("1010000000000000")
        .with_capture(1, 8)
        .with_response_chunk(11);
    let scope = connect(&sim);
    let d0 = scope.roster().by_hw_name("D0").unwrap().index;
    let d1 = scope.roster().by_hw_name("D1").unwrap().index;
    let d2 = scope.roster().by_hw_name("D2").unwrap().index;

    let Acquired::Returned(set) = trigger_and_download(&scope, &sim, false) else {
        panic!("expected a returned set");
    };
    assert_eq!(set.len(), 2 + 2);
    assert!(set.get(0).is_some());
    assert!(set.digital(d1).is_none());

    let line2 = set.digital(d2).unwrap();
    assert_eq!(line2.line, 2);
    assert_eq!(line2.interval, 1e-9);
    assert_eq!(line2.len(), 8);
    for (j, sample) in line2.samples.iter().enumerate() {
        assert_eq!(*sample, digital_level(2, j));
    }
    let line0 = set.digital(d0).unwrap();
    assert_eq!(line0.level(1), Some(true));
    assert_eq!(line0.level(2), Some(false));
    assert_eq!(sim.unread(), 0);
}

#[test]
fn logic_lines_alone_are_still_downloaded() {
    let sim = SimulatedScope::new("WS3022")
        .with_options(&["MSXX"])
        .with_logic_probe("0001000000000000")
        .with_capture(1, 4);
    let scope = connect(&sim);
    scope.disable_channel(0).unwrap();
    scope.disable_channel(1).unwrap();

    let Acquired::Returned(set) = trigger_and_download(&scope, &sim, false) else {
        panic!("expected a returned set");
    };
    assert_eq!(sim.commands_starting_with("C1:WF?"), 0);
    assert_eq!(set.iter().count(), 0);
    let d3 = scope.roster().by_hw_name("D3").unwrap().index;
    assert_eq!(set.digital_iter().map(|w| w.channel).collect::<Vec<_>>(), vec![d3]);
    assert_eq!(scope.trigger_state(), TriggerState::Idle);
}

#[test]
fn trigger_settings_follow_the_selected_source() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    scope.set_trigger_channel(1).unwrap();
    assert_eq!(sim.command_count("TRIG_SELECT EDGE,SR,C2"), 1);
    assert_eq!(scope.trigger_channel().unwrap(), 1);
    assert_eq!(sim.command_count("TRIG_SELECT?"), 0);

    scope.set_trigger_level(0.5).unwrap();
    scope.set_trigger_type(TriggerType::Falling).unwrap();
    assert_eq!(sim.command_count("C2:TRLV 5E-1 V"), 1);
    assert_eq!(sim.command_count("C2:TRSL NEG"), 1);

    scope.flush_config_cache();
    assert_eq!(scope.trigger_channel().unwrap(), 1);
    assert_eq!(scope.trigger_level().unwrap(), 0.5);
    assert_eq!(scope.trigger_type().unwrap(), TriggerType::Falling);
    assert!(scope.set_trigger_type(TriggerType::DontCare).is_err());
}

// =============================================================================
// Metering and generation
// =============================================================================

#[test]
fn missing_options_are_reported() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);

    assert_eq!(scope.meter_channel_count(), 0);
    assert_eq!(scope.generator_channel_count(), 0);
    assert!(matches!(scope.voltage(), Err(VicpError::CapabilityMissing("DVM"))));
    assert!(matches!(
        scope.set_generator_frequency(0, 1e3),
        Err(VicpError::CapabilityMissing("AFG"))
    ));
    assert_eq!(sim.commands_starting_with("VBS"), 0);
}

#[test]
fn meter_reads_through_the_automation_interface() {
    let sim = SimulatedScope::new("WS3024").with_options(&["DVM"]);
    let scope = connect(&sim);

    assert!(!scope.meter_autorange().unwrap());
    scope.set_current_meter_channel(1).unwrap();
    assert_eq!(scope.current_meter_channel().unwrap(), 1);
    assert_eq!(scope.meter_channel_name(1).unwrap(), "C2");

    scope.set_meter_mode(MeterMode::AcRmsAmplitude).unwrap();
    assert_eq!(scope.meter_mode().unwrap(), MeterMode::AcRmsAmplitude);

    scope.start_meter().unwrap();
    assert!(scope.is_meter_running());
    sim.set_vbs("app.acquisition.DVM.Voltage", "3.3");
    assert_eq!(scope.voltage().unwrap(), 3.3);
    assert_eq!(scope.peak_to_peak().unwrap(), 2.5);
    assert_eq!(scope.frequency().unwrap(), 1000.0);
    assert!(matches!(scope.current(), Err(VicpError::Unsupported(_))));
    assert!(matches!(scope.temperature(), Err(VicpError::Unsupported(_))));

    scope.stop_meter().unwrap();
    assert!(!scope.is_meter_running());
    assert_eq!(
        sim.vbs("app.acquisition.DVM.DvmEnable").as_deref(),
        Some("0")
    );
}

#[test]
fn generator_settings_are_written_and_read_back() {
    let sim = SimulatedScope::new("WS3024").with_options(&["AFG"]);
    let scope = connect(&sim);

    assert_eq!(scope.generator_channel_name(0).unwrap(), "FUNC");
    assert!(matches!(
        scope.generator_channel_name(1),
        Err(VicpError::InvalidChannel(1))
    ));

    scope.set_generator_active(0, true).unwrap();
    scope.set_generator_shape(0, WaveShape::Square).unwrap();
    scope.set_generator_frequency(0, 2500.0).unwrap();
    scope.set_generator_amplitude(0, 1.5).unwrap();
    scope.set_generator_offset(0, -0.25).unwrap();
    scope.set_generator_duty_cycle(0, 0.25).unwrap();
    scope.set_generator_rise_time(0, 2e-8).unwrap();
    scope.set_generator_fall_time(0, 3e-8).unwrap();

    assert!(scope.generator_active(0).unwrap());
    assert_eq!(scope.generator_shape(0).unwrap(), WaveShape::Square);
    assert_eq!(scope.generator_frequency(0).unwrap(), 2500.0);
    assert_eq!(scope.generator_amplitude(0).unwrap(), 1.5);
    assert_eq!(scope.generator_offset(0).unwrap(), -0.25);
    assert_eq!(scope.generator_duty_cycle(0).unwrap(), 0.25);
    assert_eq!(scope.generator_rise_time(0).unwrap(), 2e-8);
    assert_eq!(scope.generator_fall_time(0).unwrap(), 3e-8);
    assert_eq!(
        sim.vbs("app.wavesource.dutycycle").as_deref(),
        Some("25.000000")
    );
    assert!(scope.set_generator_duty_cycle(0, 1.5).is_err());
}

// =============================================================================
// Connection loss
// =============================================================================

#[test]
fn closed_link_reports_transport_errors() {
    let sim = SimulatedScope::new("WS3024");
    let scope = connect(&sim);
    scope.close().unwrap();

    scope.flush_config_cache();
    assert!(scope.voltage_range(0).unwrap_err().is_transport());
    assert!(scope.poll_trigger().unwrap_err().is_transport());
}
