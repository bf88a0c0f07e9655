//! Building and validating a complete Tor configuration.

use std::collections::HashSet;

use crate::arg::{Argument, PortValue};
use crate::err::TorrcError;
use crate::opt::TorOption;
use crate::setting::{HsService, Item, Setting};

/// Builder for a [`Torrc`].
///
/// The builder enforces the per-put rules (unique options replace,
/// `0`-valued ports wipe their siblings, identical settings coalesce);
/// [`TorrcBuilder::build`] enforces the rules that can only be checked once
/// everything is present, such as hidden-service block completeness.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TorrcBuilder {
    /// Settings in declaration order.
    settings: Vec<Setting>,
}

impl TorrcBuilder {
    /// Return a new, empty builder.
    pub fn new() -> Self {
        TorrcBuilder::default()
    }

    /// Set `option` to `arg`.
    ///
    /// For options marked unique this replaces any existing setting.  A
    /// port option set to [`PortValue::Disabled`] removes every other
    /// setting of the same option.  Putting a setting identical to an
    /// existing one is a no-op.
    pub fn put(
        &mut self,
        option: TorOption,
        arg: impl Into<Argument>,
    ) -> Result<&mut Self, TorrcError> {
        let item = Item::new(option, arg)?;
        self.put_item(item, false)?;
        Ok(self)
    }

    /// Like [`TorrcBuilder::put`], with a trailing token appended to the line.
    pub fn put_with_extra(
        &mut self,
        option: TorOption,
        arg: impl Into<Argument>,
        extra: impl Into<String>,
    ) -> Result<&mut Self, TorrcError> {
        let item = Item::new(option, arg)?.with_extra(extra)?;
        self.put_item(item, false)?;
        Ok(self)
    }

    /// Set `option` to `arg` only if no setting of `option` exists yet.
    pub fn put_if_absent(
        &mut self,
        option: TorOption,
        arg: impl Into<Argument>,
    ) -> Result<&mut Self, TorrcError> {
        let item = Item::new(option, arg)?;
        self.put_item(item, true)?;
        Ok(self)
    }

    /// Add a hidden service as a contiguous block.
    pub fn put_service(&mut self, service: HsService) -> Result<&mut Self, TorrcError> {
        let block = service.into_setting()?;
        // Blocks coalesce like any other setting.
        if !self.settings.contains(&block) {
            self.settings.push(block);
        }
        Ok(self)
    }

    /// Remove every setting of `option` (hidden-service blocks included,
    /// when `option` is the block-defining `HiddenServiceDir`).
    pub fn remove(&mut self, option: &TorOption) -> &mut Self {
        self.settings.retain(|s| s.option() != option);
        self
    }

    /// The settings accumulated so far, in declaration order.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Insert one item, applying the put rules.
    ///
    /// This is the raw path used by the torrc parser: hidden-service items
    /// other than `HiddenServiceDir` attach to the most recent block.
    pub(crate) fn put_item(&mut self, item: Item, if_absent: bool) -> Result<(), TorrcError> {
        let attrs = item.option().attrs();

        if attrs.hidden_service {
            if item.option() == &TorOption::HIDDEN_SERVICE_DIR {
                self.settings.push(Setting::single(item));
                return Ok(());
            }
            let block = self
                .settings
                .iter_mut()
                .rev()
                .find(|s| s.is_hidden_service())
                .ok_or_else(|| TorrcError::StrayHsOption {
                    option: item.option().name().to_string(),
                })?;
            block.push(item);
            return Ok(());
        }

        let exists = self.settings.iter().any(|s| s.option() == item.option());
        if if_absent && exists {
            return Ok(());
        }

        if attrs.port && item.argument() == &Argument::Port(PortValue::Disabled) {
            // Disabling a port removes every other setting of the option.
            let option = item.option().clone();
            self.settings.retain(|s| s.option() != &option);
            self.settings.push(Setting::single(item));
            return Ok(());
        }

        if attrs.unique {
            if let Some(existing) = self
                .settings
                .iter_mut()
                .find(|s| s.option() == item.option())
            {
                *existing = Setting::single(item);
                return Ok(());
            }
        }

        let setting = Setting::single(item);
        if !self.settings.contains(&setting) {
            self.settings.push(setting);
        }
        Ok(())
    }

    /// Validate the accumulated settings and produce a [`Torrc`].
    pub fn build(&self) -> Result<Torrc, TorrcError> {
        for setting in &self.settings {
            if setting.is_hidden_service() {
                validate_hs_block(setting)?;
            }
        }
        Ok(Torrc {
            settings: self.settings.clone(),
        })
    }
}

/// Check a hidden-service block: exactly one directory, exactly one
/// version, at least one port.
fn validate_hs_block(block: &Setting) -> Result<(), TorrcError> {
    let dir = block.argument();
    let mut dirs = 0_usize;
    let mut versions = 0_usize;
    let mut ports = 0_usize;
    for item in block.items() {
        match item.option().name() {
            "HiddenServiceDir" => dirs += 1,
            "HiddenServiceVersion" => versions += 1,
            "HiddenServicePort" => ports += 1,
            _ => {}
        }
    }
    let fail = |problem: String| {
        Err(TorrcError::Invalid {
            option: "HiddenServiceDir".to_string(),
            problem,
        })
    };
    if dirs != 1 {
        return fail(format!("block for {} has {} HiddenServiceDir items", dir, dirs));
    }
    if versions != 1 {
        return fail(format!(
            "block for {} needs exactly one HiddenServiceVersion, found {}",
            dir, versions
        ));
    }
    if ports == 0 {
        return fail(format!("block for {} has no HiddenServicePort", dir));
    }
    Ok(())
}

/// A validated Tor configuration, ready to render.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Torrc {
    /// Validated settings in declaration order.
    settings: Vec<Setting>,
}

impl Torrc {
    /// The settings, in declaration order.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Iterate over the settings of `option`.
    pub fn get<'a>(&'a self, option: &'a TorOption) -> impl Iterator<Item = &'a Setting> + 'a {
        self.settings.iter().filter(move |s| s.option() == option)
    }

    /// The defining argument of the first setting of `option`, if any.
    pub fn first_argument<'a>(&'a self, option: &'a TorOption) -> Option<&'a Argument> {
        self.get(option).next().map(Setting::argument)
    }

    /// Render in on-disk torrc form, one item per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for setting in &self.settings {
            out.push_str(&setting.to_string());
            out.push('\n');
        }
        out
    }

    /// Render as `--Option Value` command-line pairs.
    ///
    /// Each option consumes a single argv slot for its value, so trailing
    /// tokens are folded into that slot.
    pub fn to_cmdline(&self) -> Vec<String> {
        let mut argv = Vec::new();
        for setting in &self.settings {
            for item in setting.items() {
                argv.push(format!("--{}", item.option()));
                let mut value = item.argument().to_string();
                for extra in item.extras() {
                    value.push(' ');
                    value.push_str(extra);
                }
                argv.push(value);
            }
        }
        argv
    }

    /// Rewrite fixed ports that turn out to be unavailable to `auto`.
    ///
    /// Only options in `reassignable` are touched.  `unavailable` is asked
    /// about each fixed port; when it reports true the setting's argument
    /// becomes [`PortValue::Auto`].  Returns the reassignments made, as
    /// `(option, old port)` pairs.
    pub fn reassign_unavailable_ports<F>(
        &mut self,
        reassignable: &HashSet<TorOption>,
        mut unavailable: F,
    ) -> Vec<(TorOption, u16)>
    where
        F: FnMut(u16) -> bool,
    {
        let mut reassigned = Vec::new();
        for setting in &mut self.settings {
            if !reassignable.contains(setting.option()) {
                continue;
            }
            let port = match setting.argument() {
                Argument::Port(PortValue::Fixed(p)) => *p,
                _ => continue,
            };
            if unavailable(port) {
                setting.set_argument(Argument::Port(PortValue::Auto));
                reassigned.push((setting.option().clone(), port));
            }
        }
        reassigned
    }

    /// Convert back into a builder, for further editing.
    pub fn into_builder(self) -> TorrcBuilder {
        TorrcBuilder {
            settings: self.settings,
        }
    }
}

impl std::fmt::Display for Torrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::arg::{TorBool, UnixSocketAddr};
    use crate::setting::{HsPort, HsService};
    use assert_matches::assert_matches;

    fn b() -> TorrcBuilder {
        TorrcBuilder::new()
    }

    #[test]
    fn unique_put_replaces() {
        let mut builder = b();
        builder
            .put(TorOption::DISABLE_NETWORK, TorBool::False)
            .unwrap()
            .put(TorOption::DISABLE_NETWORK, TorBool::True)
            .unwrap();
        let torrc = builder.build().unwrap();
        assert_eq!(torrc.render(), "DisableNetwork 1\n");
    }

    #[test]
    fn unique_put_if_absent_keeps() {
        let mut builder = b();
        builder
            .put(TorOption::DISABLE_NETWORK, TorBool::False)
            .unwrap()
            .put_if_absent(TorOption::DISABLE_NETWORK, TorBool::True)
            .unwrap();
        let torrc = builder.build().unwrap();
        assert_eq!(torrc.render(), "DisableNetwork 0\n");
    }

    #[test]
    fn disabled_port_wipes_siblings() {
        let mut builder = b();
        builder
            .put(TorOption::SOCKS_PORT, PortValue::Fixed(9050))
            .unwrap()
            .put(
                TorOption::SOCKS_PORT,
                UnixSocketAddr::new("/run/tor/socks.sock").unwrap(),
            )
            .unwrap()
            .put(TorOption::SOCKS_PORT, PortValue::Disabled)
            .unwrap();
        let torrc = builder.build().unwrap();
        assert_eq!(torrc.render(), "SocksPort 0\n");

        // Exactly the "SocksPort 0" settings disappear when removed.
        let mut builder = torrc.into_builder();
        builder.remove(&TorOption::SOCKS_PORT);
        assert_eq!(builder.build().unwrap().render(), "");
    }

    #[test]
    fn identical_settings_coalesce() {
        let mut builder = b();
        builder
            .put(TorOption::SOCKS_PORT, PortValue::Fixed(9050))
            .unwrap()
            .put(TorOption::SOCKS_PORT, PortValue::Fixed(9050))
            .unwrap()
            .put(TorOption::SOCKS_PORT, PortValue::Fixed(9150))
            .unwrap();
        let torrc = builder.build().unwrap();
        assert_eq!(torrc.render(), "SocksPort 9050\nSocksPort 9150\n");
    }

    #[test]
    fn incomplete_hs_block_rejected() {
        let mut builder = b();
        builder
            .put_item(
                crate::setting::Item::new(
                    TorOption::HIDDEN_SERVICE_DIR,
                    Argument::path("/tmp/foo").unwrap(),
                )
                .unwrap(),
                false,
            )
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("HiddenServicePort"), "{}", err);
    }

    #[test]
    fn stray_hs_option_rejected() {
        let mut builder = b();
        let err = builder
            .put(TorOption::HIDDEN_SERVICE_VERSION, Argument::Int(3))
            .unwrap_err();
        assert_matches!(err, TorrcError::StrayHsOption { .. });
    }

    #[test]
    fn hs_blocks_render_contiguously() {
        let mut builder = b();
        builder
            .put(TorOption::SOCKS_PORT, PortValue::Auto)
            .unwrap()
            .put_service(
                HsService::builder()
                    .dir("/var/lib/tor/hs/one")
                    .port(HsPort::new(80))
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .put(TorOption::DISABLE_NETWORK, TorBool::True)
            .unwrap();
        let torrc = builder.build().unwrap();
        assert_eq!(
            torrc.render(),
            "SocksPort auto\n\
             HiddenServiceDir /var/lib/tor/hs/one\n\
             HiddenServiceVersion 3\n\
             HiddenServicePort 80\n\
             DisableNetwork 1\n"
        );
    }

    #[test]
    fn cmdline_rendering() {
        let mut builder = b();
        builder
            .put(TorOption::SOCKS_PORT, PortValue::Fixed(9050))
            .unwrap()
            .put(
                TorOption::DATA_DIRECTORY,
                Argument::path("/var/lib/tor data").unwrap(),
            )
            .unwrap();
        let torrc = builder.build().unwrap();
        assert_eq!(
            torrc.to_cmdline(),
            vec![
                "--SocksPort".to_string(),
                "9050".to_string(),
                "--DataDirectory".to_string(),
                "\"/var/lib/tor data\"".to_string(),
            ]
        );
    }

    #[test]
    fn port_reassignment_is_opt_in() {
        let mut builder = b();
        builder
            .put(TorOption::SOCKS_PORT, PortValue::Fixed(9050))
            .unwrap()
            .put(TorOption::DNS_PORT, PortValue::Fixed(5353))
            .unwrap();
        let mut torrc = builder.build().unwrap();

        let reassignable: HashSet<_> = [TorOption::SOCKS_PORT].into_iter().collect();
        let moved = torrc.reassign_unavailable_ports(&reassignable, |_| true);
        assert_eq!(moved, vec![(TorOption::SOCKS_PORT, 9050)]);
        assert_eq!(torrc.render(), "SocksPort auto\nDNSPort 5353\n");
    }
}
