//! External collaborators: `Driver`, `AIEngine`, and the view-hierarchy
//! value types the selector/condition code queries. These are out of
//! scope to *implement* — only the interfaces the rest of the crate
//! depends on are specified here.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::FlowError;
use crate::protocol::{Direction, Orientation};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Fraction of `self` that overlaps `viewport`, used by
    /// `scrollUntilVisible`'s visibility-percentage check.
    pub fn visible_fraction_within(&self, viewport: Bounds) -> f64 {
        let x1 = self.x.max(viewport.x);
        let y1 = self.y.max(viewport.y);
        let x2 = (self.x + self.width).min(viewport.x + viewport.width);
        let y2 = (self.y + self.height).min(viewport.y + viewport.height);
        let overlap_w = (x2 - x1).max(0.0);
        let overlap_h = (y2 - y1).max(0.0);
        let area = self.width * self.height;
        if area <= 0.0 {
            return 0.0;
        }
        (overlap_w * overlap_h) / area
    }
}

/// A single node in a view-hierarchy snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewNode {
    pub id: Option<String>,
    pub text: Option<String>,
    pub hint_text: Option<String>,
    pub accessibility_text: Option<String>,
    pub bounds: Bounds,
    pub clickable: bool,
    pub enabled: bool,
    pub selected: bool,
    pub checked: bool,
    pub focused: bool,
    pub traits: Vec<String>,
    pub children: Vec<ViewNode>,
}

impl ViewNode {
    /// Depth-first iterator over this node and all descendants.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &ViewNode> + '_> {
        Box::new(
            std::iter::once(self).chain(self.children.iter().flat_map(|c| c.iter())),
        )
    }

    pub fn first_non_empty_text(&self) -> Option<&str> {
        [&self.text, &self.hint_text, &self.accessibility_text]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.is_empty())
    }
}

/// Opaque tree exposed by the driver at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewHierarchy {
    pub root: ViewNode,
}

impl ViewHierarchy {
    pub fn all_nodes(&self) -> Vec<&ViewNode> {
        self.root.iter().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub platform: String,
    pub width: f64,
    pub height: f64,
}

/// A long-lived screen recording handle. Closing twice must be a no-op.
pub trait Recording: Send {
    fn close(&mut self);
}

/// An AI-produced finding surfaced by the `*-with-ai` commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Defect {
    pub reasoning: String,
    pub category: String,
}

/// Remote predictor used by `assert-with-ai`, `assert-no-defects-with-ai`,
/// and `extract-text-with-ai`. Its absence is only an error at the
/// commands that need it.
#[async_trait]
pub trait AIEngine: Send + Sync {
    async fn find_defects(&self, screenshot: &[u8]) -> Result<Vec<Defect>, FlowError>;
    async fn perform_assertion(
        &self,
        screenshot: &[u8],
        assertion: &str,
    ) -> Result<Option<Defect>, FlowError>;
    async fn extract_text(&self, screenshot: &[u8], query: &str) -> Result<String, FlowError>;
}

/// Parameters a `tap-on-element` command threads through to the driver.
#[derive(Debug, Clone, Default)]
pub struct TapOptions {
    pub retry_if_no_change: bool,
    pub wait_until_visible: bool,
    pub long_press: bool,
    pub app_id: Option<String>,
    pub tap_repeat: Option<u32>,
    pub wait_to_settle_timeout_ms: Option<u64>,
}

/// The device-automation capability bundle the interpreter drives. Out of
/// scope to implement; only the contract is owned here.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn view_hierarchy(&self) -> Result<ViewHierarchy, FlowError>;
    async fn cached_device_info(&self) -> DeviceInfo;
    async fn device_info(&self) -> Result<DeviceInfo, FlowError>;
    fn is_unicode_input_supported(&self) -> bool;

    async fn tap_element(&self, node: &ViewNode, options: TapOptions) -> Result<(), FlowError>;
    async fn tap_point(&self, x: f64, y: f64, long_press: bool) -> Result<(), FlowError>;

    async fn swipe_direction(
        &self,
        direction: Direction,
        duration: Duration,
        wait_to_settle: Option<Duration>,
    ) -> Result<(), FlowError>;
    async fn swipe_points(
        &self,
        start: (f64, f64),
        end: (f64, f64),
        duration: Duration,
        wait_to_settle: Option<Duration>,
    ) -> Result<(), FlowError>;
    async fn swipe_from_center(
        &self,
        direction: Direction,
        duration: Duration,
        wait_to_settle: Option<Duration>,
    ) -> Result<(), FlowError>;

    async fn input_text(&self, text: &str) -> Result<(), FlowError>;
    async fn erase_text(&self, char_count: Option<u32>) -> Result<(), FlowError>;
    async fn press_key(&self, code: &str) -> Result<(), FlowError>;
    async fn hide_keyboard(&self) -> Result<(), FlowError>;
    async fn back_press(&self) -> Result<(), FlowError>;

    async fn open_link(
        &self,
        url: &str,
        app_id: Option<&str>,
        auto_verify: bool,
        browser: bool,
    ) -> Result<(), FlowError>;

    async fn launch_app(
        &self,
        app_id: &str,
        args: &std::collections::HashMap<String, String>,
        stop_if_running: bool,
    ) -> Result<(), FlowError>;
    async fn stop_app(&self, app_id: Option<&str>) -> Result<(), FlowError>;
    async fn kill_app(&self, app_id: Option<&str>) -> Result<(), FlowError>;
    async fn clear_app_state(&self, app_id: Option<&str>) -> Result<(), FlowError>;
    async fn clear_keychain(&self) -> Result<(), FlowError>;
    async fn set_permissions(
        &self,
        app_id: &str,
        permissions: &std::collections::HashMap<String, String>,
    ) -> Result<(), FlowError>;

    async fn set_location(&self, latitude: f64, longitude: f64) -> Result<(), FlowError>;
    async fn set_orientation(&self, orientation: Orientation) -> Result<(), FlowError>;
    async fn set_airplane_mode(&self, enabled: bool) -> Result<(), FlowError>;
    async fn is_airplane_mode_enabled(&self) -> Result<bool, FlowError>;
    async fn travel(&self, points: &[(f64, f64)], speed: Option<f64>) -> Result<(), FlowError>;

    async fn add_media(&self, paths: &[String]) -> Result<(), FlowError>;
    async fn take_screenshot(&self, compressed: bool) -> Result<Vec<u8>, FlowError>;
    async fn start_screen_recording(&self) -> Result<Box<dyn Recording>, FlowError>;

    async fn wait_for_animation_to_end(&self, timeout: Duration) -> Result<(), FlowError>;
    async fn wait_for_app_to_settle(&self) -> Result<(), FlowError>;

    fn set_android_chrome_dev_tools_enabled(&self, enabled: bool);
}

/// Test doubles used by this crate's own tests and by downstream
/// integration tests, favoring hand-written fakes over a mocking
/// framework.
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        hierarchy: ViewHierarchy,
        swipes: Vec<Direction>,
        taps: Vec<(f64, f64)>,
        inputs: Vec<String>,
        launched: Vec<String>,
        recording_active: bool,
    }

    /// A driver whose view hierarchy can be swapped out mid-test (e.g. to
    /// simulate an element appearing after N swipes), and which records
    /// every call for assertions.
    #[derive(Default)]
    pub struct FakeDriver {
        state: Mutex<Recorded>,
        unicode_supported: bool,
    }

    impl FakeDriver {
        pub fn new(hierarchy: ViewHierarchy) -> Self {
            Self {
                state: Mutex::new(Recorded {
                    hierarchy,
                    ..Default::default()
                }),
                unicode_supported: true,
            }
        }

        pub fn without_unicode_support(mut self) -> Self {
            self.unicode_supported = false;
            self
        }

        pub fn set_hierarchy(&self, hierarchy: ViewHierarchy) {
            self.state.lock().unwrap().hierarchy = hierarchy;
        }

        pub fn swipe_count(&self) -> usize {
            self.state.lock().unwrap().swipes.len()
        }

        pub fn launched_apps(&self) -> Vec<String> {
            self.state.lock().unwrap().launched.clone()
        }

        pub fn inputs(&self) -> Vec<String> {
            self.state.lock().unwrap().inputs.clone()
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        async fn view_hierarchy(&self) -> Result<ViewHierarchy, FlowError> {
            Ok(self.state.lock().unwrap().hierarchy.clone())
        }

        async fn cached_device_info(&self) -> DeviceInfo {
            DeviceInfo {
                platform: "android".to_string(),
                width: 1080.0,
                height: 2400.0,
            }
        }

        async fn device_info(&self) -> Result<DeviceInfo, FlowError> {
            Ok(self.cached_device_info().await)
        }

        fn is_unicode_input_supported(&self) -> bool {
            self.unicode_supported
        }

        async fn tap_element(&self, node: &ViewNode, _options: TapOptions) -> Result<(), FlowError> {
            self.state.lock().unwrap().taps.push(node.bounds.center());
            Ok(())
        }

        async fn tap_point(&self, x: f64, y: f64, _long_press: bool) -> Result<(), FlowError> {
            self.state.lock().unwrap().taps.push((x, y));
            Ok(())
        }

        async fn swipe_direction(
            &self,
            direction: Direction,
            _duration: Duration,
            _wait_to_settle: Option<Duration>,
        ) -> Result<(), FlowError> {
            self.state.lock().unwrap().swipes.push(direction);
            Ok(())
        }

        async fn swipe_points(
            &self,
            _start: (f64, f64),
            _end: (f64, f64),
            _duration: Duration,
            _wait_to_settle: Option<Duration>,
        ) -> Result<(), FlowError> {
            Ok(())
        }

        async fn swipe_from_center(
            &self,
            direction: Direction,
            duration: Duration,
            wait_to_settle: Option<Duration>,
        ) -> Result<(), FlowError> {
            self.swipe_direction(direction, duration, wait_to_settle).await
        }

        async fn input_text(&self, text: &str) -> Result<(), FlowError> {
            self.state.lock().unwrap().inputs.push(text.to_string());
            Ok(())
        }

        async fn erase_text(&self, _char_count: Option<u32>) -> Result<(), FlowError> {
            Ok(())
        }

        async fn press_key(&self, _code: &str) -> Result<(), FlowError> {
            Ok(())
        }

        async fn hide_keyboard(&self) -> Result<(), FlowError> {
            Ok(())
        }

        async fn back_press(&self) -> Result<(), FlowError> {
            Ok(())
        }

        async fn open_link(
            &self,
            _url: &str,
            _app_id: Option<&str>,
            _auto_verify: bool,
            _browser: bool,
        ) -> Result<(), FlowError> {
            Ok(())
        }

        async fn launch_app(
            &self,
            app_id: &str,
            _args: &std::collections::HashMap<String, String>,
            _stop_if_running: bool,
        ) -> Result<(), FlowError> {
            self.state.lock().unwrap().launched.push(app_id.to_string());
            Ok(())
        }

        async fn stop_app(&self, _app_id: Option<&str>) -> Result<(), FlowError> {
            Ok(())
        }

        async fn kill_app(&self, _app_id: Option<&str>) -> Result<(), FlowError> {
            Ok(())
        }

        async fn clear_app_state(&self, _app_id: Option<&str>) -> Result<(), FlowError> {
            Ok(())
        }

        async fn clear_keychain(&self) -> Result<(), FlowError> {
            Ok(())
        }

        async fn set_permissions(
            &self,
            _app_id: &str,
            _permissions: &std::collections::HashMap<String, String>,
        ) -> Result<(), FlowError> {
            Ok(())
        }

        async fn set_location(&self, _latitude: f64, _longitude: f64) -> Result<(), FlowError> {
            Ok(())
        }

        async fn set_orientation(&self, _orientation: Orientation) -> Result<(), FlowError> {
            Ok(())
        }

        async fn set_airplane_mode(&self, _enabled: bool) -> Result<(), FlowError> {
            Ok(())
        }

        async fn is_airplane_mode_enabled(&self) -> Result<bool, FlowError> {
            Ok(false)
        }

        async fn travel(&self, _points: &[(f64, f64)], _speed: Option<f64>) -> Result<(), FlowError> {
            Ok(())
        }

        async fn add_media(&self, _paths: &[String]) -> Result<(), FlowError> {
            Ok(())
        }

        async fn take_screenshot(&self, _compressed: bool) -> Result<Vec<u8>, FlowError> {
            Ok(vec![0u8; 4])
        }

        async fn start_screen_recording(&self) -> Result<Box<dyn Recording>, FlowError> {
            self.state.lock().unwrap().recording_active = true;
            Ok(Box::new(FakeRecording))
        }

        async fn wait_for_animation_to_end(&self, _timeout: Duration) -> Result<(), FlowError> {
            Ok(())
        }

        async fn wait_for_app_to_settle(&self) -> Result<(), FlowError> {
            Ok(())
        }

        fn set_android_chrome_dev_tools_enabled(&self, _enabled: bool) {}
    }

    pub struct FakeRecording;
    impl Recording for FakeRecording {
        fn close(&mut self) {}
    }

    /// AI engine fake whose responses are configured up front.
    #[derive(Default)]
    pub struct FakeAIEngine {
        pub defects: Vec<Defect>,
        pub assertion_defect: Option<Defect>,
        pub extracted_text: String,
    }

    #[async_trait]
    impl AIEngine for FakeAIEngine {
        async fn find_defects(&self, _screenshot: &[u8]) -> Result<Vec<Defect>, FlowError> {
            Ok(self.defects.clone())
        }

        async fn perform_assertion(
            &self,
            _screenshot: &[u8],
            _assertion: &str,
        ) -> Result<Option<Defect>, FlowError> {
            Ok(self.assertion_defect.clone())
        }

        async fn extract_text(&self, _screenshot: &[u8], _query: &str) -> Result<String, FlowError> {
            Ok(self.extracted_text.clone())
        }
    }
}
