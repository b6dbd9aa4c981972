//! Correlator control plane.
//!
//! The collector talks to the correlator members through registers. The
//! transport used to reach the registers is abstracted by the
//! [`ControlPlane`] trait. [`NodeGroup`] runs an operation on all the members
//! concurrently and gathers the errors of all the members that failed.

use crate::walsh::{SidebandStateTable, WalshPatterns};
use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use swarm_json::Member;

/// Register holding the Walsh pattern of a member.
pub const WALSH_TABLE: &str = "walsh_table";
/// Register holding the sideband state table.
pub const SB_STATES: &str = "sb_states";
/// Register holding the FID of a member.
pub const FID: &str = "fid";

/// Register access to the correlator members.
pub trait ControlPlane: Send + Sync + 'static {
    /// Writes a register of a node.
    fn write_register(
        &self,
        node: &str,
        name: &str,
        data: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Reads a register of a node.
    fn read_register(
        &self,
        node: &str,
        name: &str,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

impl<C: ControlPlane> ControlPlane for Arc<C> {
    fn write_register(
        &self,
        node: &str,
        name: &str,
        data: &[u8],
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).write_register(node, name, data)
    }

    fn read_register(
        &self,
        node: &str,
        name: &str,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send {
        (**self).read_register(node, name)
    }
}

/// Group of correlator members.
#[derive(Debug)]
pub struct NodeGroup<C> {
    plane: Arc<C>,
    members: Vec<Member>,
}

/// Returns the control plane name of a member.
///
/// This is the host name if the configuration gives one, or the data address
/// otherwise.
pub fn node_name(member: &Member) -> String {
    member
        .host
        .clone()
        .unwrap_or_else(|| member.address.to_string())
}

impl<C: ControlPlane> NodeGroup<C> {
    /// Creates a node group.
    pub fn new(plane: C, members: Vec<Member>) -> NodeGroup<C> {
        NodeGroup {
            plane: Arc::new(plane),
            members,
        }
    }

    /// Returns the control plane.
    pub fn plane(&self) -> &C {
        &self.plane
    }

    /// Returns the members of the group.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Runs an operation on every member concurrently.
    ///
    /// Returns the results of all the members in member order. If any member
    /// fails, all the failures are reported in the returned error.
    pub async fn for_each_member<F, Fut, T>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(Arc<C>, Member) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let results = futures::future::join_all(
            self.members
                .iter()
                .map(|member| f(Arc::clone(&self.plane), member.clone())),
        )
        .await;
        let mut values = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (member, result) in self.members.iter().zip(results) {
            match result {
                Ok(value) => values.push(value),
                Err(err) => {
                    errors.push(format!("FID {} ({}): {err:#}", member.fid, node_name(member)))
                }
            }
        }
        if !errors.is_empty() {
            anyhow::bail!(
                "{} of {} members failed: {}",
                errors.len(),
                self.members.len(),
                errors.join("; ")
            );
        }
        Ok(values)
    }

    /// Loads the Walsh pattern of each member.
    ///
    /// Each member receives the pattern of the antenna of its first input,
    /// one byte per symbol. Members with no antenna are skipped.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn load_walsh_patterns(&self, patterns: &WalshPatterns) -> Result<()> {
        let patterns = Arc::new(patterns.clone());
        self.for_each_member(|plane, member| {
            let patterns = Arc::clone(&patterns);
            async move {
                let Some(antenna) = member.inputs[0].antenna else {
                    return Ok(());
                };
                let pattern = patterns
                    .get(antenna)
                    .ok_or_else(|| anyhow::anyhow!("no Walsh pattern for antenna {antenna}"))?;
                plane
                    .write_register(&node_name(&member), WALSH_TABLE, pattern)
                    .await
            }
        })
        .await?;
        tracing::info!(members = self.members.len(), "Walsh patterns loaded");
        Ok(())
    }

    /// Loads the sideband state table into every member.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn load_sideband_states(&self, table: &SidebandStateTable) -> Result<()> {
        let data: Arc<[u8]> = table.to_bytes().into();
        self.for_each_member(|plane, member| {
            let data = Arc::clone(&data);
            async move {
                plane
                    .write_register(&node_name(&member), SB_STATES, &data)
                    .await
            }
        })
        .await?;
        tracing::info!(
            members = self.members.len(),
            period = table.period(),
            pairs = table.pairs(),
            "sideband states loaded"
        );
        Ok(())
    }

    /// Programs the members for an observation.
    ///
    /// The FIDs reported by the members are checked first. The Walsh patterns
    /// and the sideband state table are only loaded when `sideband_states` is
    /// given.
    pub async fn program(
        &self,
        walsh: &WalshPatterns,
        sideband_states: Option<&SidebandStateTable>,
    ) -> Result<()> {
        self.read_fids().await?;
        if let Some(table) = sideband_states {
            self.load_walsh_patterns(walsh).await?;
            self.load_sideband_states(table).await?;
        }
        Ok(())
    }

    /// Reads the FID of each member and checks it against the configuration.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn read_fids(&self) -> Result<Vec<u32>> {
        self.for_each_member(|plane, member| async move {
            let data = plane.read_register(&node_name(&member), FID).await?;
            let fid = u32::from_be_bytes(data.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("FID register has {} bytes instead of 4", data.len())
            })?);
            anyhow::ensure!(
                fid == member.fid,
                "node reports FID {fid} but it is configured as FID {}",
                member.fid
            );
            Ok(fid)
        })
        .await
    }
}

/// In-memory register file.
///
/// This is a [`ControlPlane`] that keeps the registers of every node in
/// memory. No node ever sees these registers, so it is only useful to
/// exercise [`NodeGroup`] and the application without correlator hardware.
#[derive(Debug, Default)]
pub struct RegisterFile {
    registers: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl RegisterFile {
    /// Creates an empty register file.
    pub fn new() -> RegisterFile {
        RegisterFile::default()
    }

    /// Creates a register file with the FID register of each member set.
    pub fn with_members(members: &[Member]) -> RegisterFile {
        let file = RegisterFile::new();
        for member in members {
            file.set(&node_name(member), FID, &member.fid.to_be_bytes());
        }
        file
    }

    /// Sets the value of a register.
    pub fn set(&self, node: &str, name: &str, data: &[u8]) {
        self.registers
            .lock()
            .unwrap()
            .insert((node.to_string(), name.to_string()), data.to_vec());
    }

    /// Returns the value of a register.
    pub fn get(&self, node: &str, name: &str) -> Option<Vec<u8>> {
        self.registers
            .lock()
            .unwrap()
            .get(&(node.to_string(), name.to_string()))
            .cloned()
    }
}

impl ControlPlane for RegisterFile {
    async fn write_register(&self, node: &str, name: &str, data: &[u8]) -> Result<()> {
        self.set(node, name, data);
        Ok(())
    }

    async fn read_register(&self, node: &str, name: &str) -> Result<Vec<u8>> {
        self.get(node, name)
            .ok_or_else(|| anyhow::anyhow!("register {name} of node {node} has not been written"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::input::SignalInput;
    use crate::order::xeng_order;
    use swarm_json::Input;

    fn member(fid: u32, antenna: Option<u8>) -> Member {
        let input = |polarization| Input {
            antenna,
            chunk: antenna.map(|_| 0),
            polarization: antenna.map(|_| polarization),
        };
        Member {
            fid,
            address: format!("10.0.0.{}", fid + 1).parse().unwrap(),
            host: Some(format!("roach{fid}")),
            inputs: [input(0), input(1)],
        }
    }

    fn members() -> Vec<Member> {
        vec![member(0, Some(3)), member(1, Some(5)), member(2, None), member(3, Some(3))]
    }

    #[test]
    fn names() {
        let mut m = member(0, None);
        assert_eq!(node_name(&m), "roach0");
        m.host = None;
        assert_eq!(node_name(&m), "10.0.0.1");
    }

    #[tokio::test]
    async fn walsh_patterns() {
        let group = NodeGroup::new(RegisterFile::new(), members());
        let mut walsh = WalshPatterns::new();
        walsh.insert(3, "0f1").unwrap();
        walsh.insert(5, "22").unwrap();
        group.load_walsh_patterns(&walsh).await.unwrap();
        let regs = group.plane();
        assert_eq!(regs.get("roach0", WALSH_TABLE), Some(vec![0, 15, 1]));
        assert_eq!(regs.get("roach1", WALSH_TABLE), Some(vec![2, 2]));
        assert_eq!(regs.get("roach2", WALSH_TABLE), None);
        assert_eq!(regs.get("roach3", WALSH_TABLE), Some(vec![0, 15, 1]));
    }

    #[tokio::test]
    async fn missing_walsh_pattern() {
        let group = NodeGroup::new(RegisterFile::new(), members());
        let mut walsh = WalshPatterns::new();
        walsh.insert(3, "01").unwrap();
        let err = group.load_walsh_patterns(&walsh).await.unwrap_err();
        assert!(format!("{err:#}").contains("antenna 5"));
        // the other members are still loaded
        assert!(group.plane().get("roach3", WALSH_TABLE).is_some());
    }

    #[tokio::test]
    async fn sideband_states() {
        let group = NodeGroup::new(RegisterFile::new(), members());
        let xeng = xeng_order(&[
            [SignalInput::new(3, 0, 0), SignalInput::new(3, 0, 1)],
            [SignalInput::new(5, 0, 0), SignalInput::new(5, 0, 1)],
        ])
        .unwrap();
        let mut walsh = WalshPatterns::new();
        walsh.insert(3, "01").unwrap();
        walsh.insert(5, "00").unwrap();
        let table = SidebandStateTable::new(&xeng, &walsh, 4, 1).unwrap();
        group.load_sideband_states(&table).await.unwrap();
        for m in group.members() {
            assert_eq!(
                group.plane().get(&node_name(m), SB_STATES),
                Some(table.to_bytes())
            );
        }
    }

    #[tokio::test]
    async fn fids() {
        let members = members();
        let group = NodeGroup::new(RegisterFile::with_members(&members), members);
        assert_eq!(group.read_fids().await.unwrap(), vec![0, 1, 2, 3]);
        group.plane().set("roach1", FID, &7u32.to_be_bytes());
        group.plane().set("roach2", FID, &[0, 1]);
        let err = format!("{:#}", group.read_fids().await.unwrap_err());
        assert!(err.starts_with("2 of 4 members failed"), "{err}");
        assert!(err.contains("FID 1 (roach1)"), "{err}");
        assert!(err.contains("FID 2 (roach2)"), "{err}");
    }

    #[tokio::test]
    async fn program() {
        let members = members();
        let regs = Arc::new(RegisterFile::with_members(&members));
        let group = NodeGroup::new(Arc::clone(&regs), members);
        let mut walsh = WalshPatterns::new();
        walsh.insert(3, "01").unwrap();
        walsh.insert(5, "00").unwrap();

        // without a sideband state table only the FIDs are checked
        group.program(&walsh, None).await.unwrap();
        assert_eq!(regs.get("roach0", WALSH_TABLE), None);

        let xeng = xeng_order(&[
            [SignalInput::new(3, 0, 0), SignalInput::new(3, 0, 1)],
            [SignalInput::new(5, 0, 0), SignalInput::new(5, 0, 1)],
        ])
        .unwrap();
        let table = SidebandStateTable::new(&xeng, &walsh, 4, 1).unwrap();
        group.program(&walsh, Some(&table)).await.unwrap();
        assert_eq!(regs.get("roach0", WALSH_TABLE), Some(vec![0, 1]));
        assert_eq!(regs.get("roach1", WALSH_TABLE), Some(vec![0, 0]));
        assert_eq!(regs.get("roach3", SB_STATES), Some(table.to_bytes()));

        // a member reporting the wrong FID stops programming
        let regs = Arc::new(RegisterFile::with_members(&self::members()));
        regs.set("roach3", FID, &0u32.to_be_bytes());
        let group = NodeGroup::new(Arc::clone(&regs), self::members());
        assert!(group.program(&walsh, Some(&table)).await.is_err());
        assert_eq!(regs.get("roach0", WALSH_TABLE), None);
        assert_eq!(regs.get("roach0", SB_STATES), None);
    }

    struct Flaky;

    impl ControlPlane for Flaky {
        async fn write_register(&self, node: &str, _name: &str, _data: &[u8]) -> Result<()> {
            tokio::task::yield_now().await;
            anyhow::ensure!(node != "roach2", "timeout");
            Ok(())
        }

        async fn read_register(&self, _node: &str, _name: &str) -> Result<Vec<u8>> {
            anyhow::bail!("not readable")
        }
    }

    #[tokio::test]
    async fn errors_are_aggregated() {
        let group = NodeGroup::new(Flaky, members());
        let results = group
            .for_each_member(|plane, member| async move {
                plane
                    .write_register(&node_name(&member), "x", &[])
                    .await
                    .map(|()| member.fid)
            })
            .await;
        let err = format!("{:#}", results.unwrap_err());
        assert_eq!(err, "1 of 4 members failed: FID 2 (roach2): timeout");
        assert!(group.read_fids().await.is_err());
    }
}
