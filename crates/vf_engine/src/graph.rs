// crates/vf_engine/src/graph.rs

//! 模板依赖图
//!
//! 依据读写集推导模板间的执行顺序约束：
//!
//! - RAW: u 写的字段被 v 读，则 u -> v（与声明顺序无关）
//! - WAW: u 与 v 写同一字段且 u 先声明，则 u -> v
//! - WAR: u 读的字段被 v 写且 u 先声明，则 u -> v
//!
//! 调度用 Kahn 算法，零入度队列以插入顺序作为决定性的
//! 并列决胜；图有环时返回 [`EngineError::Cycle`]，绝不输出
//! 部分调度。环检测另以白/灰/黑三色 DFS 独立实现，便于
//! 交叉验证。

use crate::error::{EngineError, EngineResult};
use std::collections::{BTreeSet, HashMap};

/// 依赖图节点
#[derive(Debug, Clone)]
pub struct DependencyNode {
    /// 节点名（模板名）
    pub name: String,
    /// 读字段集
    pub reads: Vec<String>,
    /// 写字段集
    pub writes: Vec<String>,
}

/// 模板依赖图
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// 空图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加节点
    ///
    /// 节点名重复返回 [`EngineError::DuplicateStencil`]。
    pub fn add_node(
        &mut self,
        name: &str,
        reads: Vec<String>,
        writes: Vec<String>,
    ) -> EngineResult<()> {
        if self.index.contains_key(name) {
            return Err(EngineError::DuplicateStencil(name.to_string()));
        }
        log::debug!(
            "依赖图添加节点 '{}': 读 {} 字段, 写 {} 字段",
            name,
            reads.len(),
            writes.len()
        );
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(DependencyNode {
            name: name.to_string(),
            reads,
            writes,
        });
        Ok(())
    }

    /// 节点数
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// 节点是否存在
    pub fn has_node(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// 节点列表（插入顺序）
    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    /// 清空
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
    }

    /// 节点的前驱名集合
    pub fn predecessors(&self, name: &str) -> EngineResult<Vec<String>> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| EngineError::UnknownStencil(name.to_string()))?;
        let (preds, _) = self.compute_edges();
        Ok(preds[idx]
            .iter()
            .map(|&p| self.nodes[p].name.clone())
            .collect())
    }

    /// 两个字段列表是否有交集
    fn intersects(a: &[String], b: &[String]) -> bool {
        a.iter().any(|x| b.iter().any(|y| x == y))
    }

    /// 推导边：返回 (前驱集, 后继表)，均以节点下标表示
    fn compute_edges(&self) -> (Vec<BTreeSet<usize>>, Vec<Vec<usize>>) {
        let n = self.nodes.len();
        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for u in 0..n {
            for v in 0..n {
                if u == v {
                    continue;
                }
                let nu = &self.nodes[u];
                let nv = &self.nodes[v];
                let raw = Self::intersects(&nu.writes, &nv.reads);
                let waw = u < v && Self::intersects(&nu.writes, &nv.writes);
                let war = u < v && Self::intersects(&nu.reads, &nv.writes);
                if raw || waw || war {
                    preds[v].insert(u);
                }
            }
        }
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (v, pv) in preds.iter().enumerate() {
            for &u in pv {
                succs[u].push(v);
            }
        }
        (preds, succs)
    }

    /// Kahn 拓扑排序
    ///
    /// 返回完整调度（长度等于节点数）；检测到环时返回
    /// `Cycle(残留正入度节点之一)`。
    pub fn schedule(&self) -> EngineResult<Vec<String>> {
        let n = self.nodes.len();
        let (preds, succs) = self.compute_edges();

        let mut in_degree: Vec<usize> = preds.iter().map(|p| p.len()).collect();
        // 零入度节点按插入顺序出队
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

        let mut order = Vec::with_capacity(n);
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(self.nodes[next].name.clone());
            for &succ in &succs[next] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }

        if order.len() != n {
            let culprit = in_degree
                .iter()
                .position(|&d| d > 0)
                .map(|i| self.nodes[i].name.clone())
                .unwrap_or_default();
            log::error!(
                "依赖图存在环: 仅调度 {}/{} 个节点",
                order.len(),
                n
            );
            return Err(EngineError::Cycle(culprit));
        }

        log::info!("执行调度生成: {} 个模板", order.len());
        Ok(order)
    }

    /// 三色 DFS 环检测
    pub fn has_cycle(&self) -> bool {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let n = self.nodes.len();
        let (_, succs) = self.compute_edges();
        let mut color = vec![WHITE; n];

        fn visit(node: usize, succs: &[Vec<usize>], color: &mut [u8]) -> bool {
            color[node] = GRAY;
            for &next in &succs[node] {
                if color[next] == GRAY {
                    return true;
                }
                if color[next] == WHITE && visit(next, succs, color) {
                    return true;
                }
            }
            color[node] = BLACK;
            false
        }

        for start in 0..n {
            if color[start] == WHITE && visit(start, &succs, &mut color) {
                return true;
            }
        }
        false
    }

    /// 导出 GraphViz DOT 文本
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        out.push_str("digraph StencilDependencies {\n");
        out.push_str("    rankdir=LR;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for node in &self.nodes {
            out.push_str(&format!("    \"{}\" [label=\"{}\"];\n", node.name, node.name));
        }
        out.push('\n');

        let (preds, _) = self.compute_edges();
        for (v, pv) in preds.iter().enumerate() {
            for &u in pv {
                out.push_str(&format!(
                    "    \"{}\" -> \"{}\";\n",
                    self.nodes[u].name, self.nodes[v].name
                ));
            }
        }
        out.push_str("}\n");
        out
    }

    /// 两个节点的读写集是否相交（调度覆盖时用于屏障判定）
    pub fn access_sets_conflict(&self, a: &str, b: &str) -> bool {
        let (Some(&ia), Some(&ib)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        let na = &self.nodes[ia];
        let nb = &self.nodes[ib];
        Self::intersects(&na.writes, &nb.reads)
            || Self::intersects(&na.writes, &nb.writes)
            || Self::intersects(&na.reads, &nb.writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_linear_chain() {
        let mut g = DependencyGraph::new();
        g.add_node("A", strs(&[]), strs(&["x"])).unwrap();
        g.add_node("B", strs(&["x"]), strs(&["y"])).unwrap();
        g.add_node("C", strs(&["y"]), strs(&["z"])).unwrap();

        assert_eq!(g.schedule().unwrap(), vec!["A", "B", "C"]);
        assert!(!g.has_cycle());
    }

    #[test]
    fn test_diamond() {
        let mut g = DependencyGraph::new();
        g.add_node("A", strs(&[]), strs(&["x"])).unwrap();
        g.add_node("B", strs(&["x"]), strs(&["y"])).unwrap();
        g.add_node("C", strs(&["x"]), strs(&["z"])).unwrap();
        g.add_node("D", strs(&["y", "z"]), strs(&["r"])).unwrap();

        let order = g.schedule().unwrap();
        assert_eq!(order.len(), 4);
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();
        assert!(pos("A") < pos("B"));
        assert!(pos("A") < pos("C"));
        assert!(pos("B") < pos("D"));
        assert!(pos("C") < pos("D"));
        assert!(!g.has_cycle());
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = DependencyGraph::new();
        g.add_node("A", strs(&["y"]), strs(&["x"])).unwrap();
        g.add_node("B", strs(&["x"]), strs(&["y"])).unwrap();

        assert!(matches!(g.schedule(), Err(EngineError::Cycle(_))));
        assert!(g.has_cycle());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut g = DependencyGraph::new();
        g.add_node("A", strs(&[]), strs(&["x"])).unwrap();
        assert!(matches!(
            g.add_node("A", strs(&[]), strs(&["y"])),
            Err(EngineError::DuplicateStencil(_))
        ));
    }

    #[test]
    fn test_waw_follows_declaration_order() {
        let mut g = DependencyGraph::new();
        g.add_node("first", strs(&[]), strs(&["x"])).unwrap();
        g.add_node("second", strs(&[]), strs(&["x"])).unwrap();
        assert_eq!(g.schedule().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_read_then_write_same_field_is_cycle() {
        // reader 读 x，后声明的 writer 写 x：
        // WAR 给出 reader -> writer，RAW 给出 writer -> reader，成环
        let mut g = DependencyGraph::new();
        g.add_node("reader", strs(&["x"]), strs(&["y"])).unwrap();
        g.add_node("writer", strs(&[]), strs(&["x"])).unwrap();
        assert!(g.has_cycle());
        assert!(matches!(g.schedule(), Err(EngineError::Cycle(_))));
    }

    #[test]
    fn test_in_place_update_is_not_cycle() {
        // 同一模板读写同一字段不构成自环
        let mut g = DependencyGraph::new();
        g.add_node("relax", strs(&["p"]), strs(&["p"])).unwrap();
        assert!(!g.has_cycle());
        assert_eq!(g.schedule().unwrap(), vec!["relax"]);
    }

    #[test]
    fn test_independent_nodes_keep_insertion_order() {
        let mut g = DependencyGraph::new();
        g.add_node("zeta", strs(&[]), strs(&["a"])).unwrap();
        g.add_node("alpha", strs(&[]), strs(&["b"])).unwrap();
        g.add_node("mid", strs(&[]), strs(&["c"])).unwrap();
        assert_eq!(g.schedule().unwrap(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_to_dot_contains_nodes_and_edges() {
        let mut g = DependencyGraph::new();
        g.add_node("A", strs(&[]), strs(&["x"])).unwrap();
        g.add_node("B", strs(&["x"]), strs(&[])).unwrap();
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("\"A\" [label=\"A\"];"));
        assert!(dot.contains("\"A\" -> \"B\";"));
    }

    #[test]
    fn test_access_sets_conflict() {
        let mut g = DependencyGraph::new();
        g.add_node("A", strs(&[]), strs(&["x"])).unwrap();
        g.add_node("B", strs(&["x"]), strs(&[])).unwrap();
        g.add_node("C", strs(&["q"]), strs(&[])).unwrap();
        assert!(g.access_sets_conflict("A", "B"));
        assert!(!g.access_sets_conflict("B", "C"));
    }
}
