// crates/vf_grid/src/source.rs

//! 宿主稀疏网格
//!
//! 引擎对外部网格文件库的依赖面是：字节数组、元素类型、包围盒
//! 与逐叶迭代器。本模块提供满足该接口的宿主表示：8x8x8 叶块，
//! 每叶一个 512 位占用掩码，活跃体素各存一个 f32 标量值。
//!
//! `GridBuilder` 逐体素构建；`HostGrid::dense_box` 生成测试与
//! 合成场景用的实心盒网格。

use crate::error::{GridError, GridResult};
use std::collections::HashMap;
use vf_foundation::{morton_encode, CoordBBox, VoxelCoord};

/// 叶块边长（体素）
pub const LEAF_DIM: i32 = 8;

/// 叶块体素总数
pub const LEAF_VOLUME: usize = 512;

/// 序列化魔数
const GRID_MAGIC: u32 = 0x5646_4752; // "VFGR"

/// 序列化版本
const GRID_VERSION: u32 = 1;

/// 8x8x8 叶块
///
/// `origin` 是叶块最小角坐标，各分量为 8 的倍数。位索引约定为
/// `(x << 6) | (y << 3) | z`，`values` 按位索引升序存放活跃值。
#[derive(Debug, Clone)]
pub struct Leaf {
    /// 叶块最小角（8 对齐）
    pub origin: VoxelCoord,
    /// 占用位掩码（512 位）
    pub mask: [u64; 8],
    /// 活跃体素值，按位索引升序
    pub values: Vec<f32>,
}

impl Leaf {
    /// 空叶块
    pub fn new(origin: VoxelCoord) -> Self {
        Self {
            origin,
            mask: [0; 8],
            values: Vec::new(),
        }
    }

    /// 叶块包围盒
    #[inline]
    pub fn bbox(&self) -> CoordBBox {
        CoordBBox::new(
            self.origin,
            self.origin + VoxelCoord::splat(LEAF_DIM - 1),
        )
    }

    /// 活跃体素数量
    #[inline]
    pub fn active_count(&self) -> u32 {
        self.mask.iter().map(|w| w.count_ones()).sum()
    }

    /// 局部坐标对应的位索引
    #[inline]
    fn bit_index(local: VoxelCoord) -> usize {
        ((local.x as usize) << 6) | ((local.y as usize) << 3) | (local.z as usize)
    }

    /// 位是否置位
    #[inline]
    fn is_set(&self, bit: usize) -> bool {
        self.mask[bit >> 6] & (1u64 << (bit & 63)) != 0
    }

    /// 置位之前已置位的位数（即该体素在 values 中的下标）
    #[inline]
    fn rank(&self, bit: usize) -> usize {
        let word = bit >> 6;
        let mut count = 0usize;
        for w in &self.mask[..word] {
            count += w.count_ones() as usize;
        }
        let below = self.mask[word] & ((1u64 << (bit & 63)) - 1);
        count + below.count_ones() as usize
    }

    /// 迭代活跃体素的 (全局坐标, 值)
    pub fn iter_active(&self) -> impl Iterator<Item = (VoxelCoord, f32)> + '_ {
        (0..LEAF_VOLUME).filter_map(move |bit| {
            if !self.is_set(bit) {
                return None;
            }
            let local = VoxelCoord::new(
                (bit >> 6) as i32,
                ((bit >> 3) & 7) as i32,
                (bit & 7) as i32,
            );
            Some((self.origin + local, self.values[self.rank(bit)]))
        })
    }
}

/// 宿主稀疏网格
#[derive(Debug, Clone)]
pub struct HostGrid {
    background: f32,
    bbox: CoordBBox,
    leaves: Vec<Leaf>,
    active_count: u32,
}

impl HostGrid {
    /// 背景值（非活跃体素的取值）
    #[inline]
    pub fn background(&self) -> f32 {
        self.background
    }

    /// 活跃体素包围盒
    #[inline]
    pub fn bbox(&self) -> CoordBBox {
        self.bbox
    }

    /// 活跃体素总数
    #[inline]
    pub fn active_voxel_count(&self) -> u32 {
        self.active_count
    }

    /// 叶块列表（Morton 序）
    #[inline]
    pub fn leaves(&self) -> &[Leaf] {
        &self.leaves
    }

    /// 迭代所有活跃体素
    pub fn iter_active(&self) -> impl Iterator<Item = (VoxelCoord, f32)> + '_ {
        self.leaves.iter().flat_map(|leaf| leaf.iter_active())
    }

    /// 构造实心盒网格，所有体素取同一值
    pub fn dense_box(min: VoxelCoord, max: VoxelCoord, value: f32) -> GridResult<HostGrid> {
        let mut builder = GridBuilder::new(0.0);
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                for z in min.z..=max.z {
                    builder.set(VoxelCoord::new(x, y, z), value);
                }
            }
        }
        builder.build()
    }

    /// 序列化为不透明字节数组
    ///
    /// 该字节流即上传到 GPU 的"原始网格"缓冲内容。
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&GRID_MAGIC.to_le_bytes());
        out.extend_from_slice(&GRID_VERSION.to_le_bytes());
        out.extend_from_slice(&self.background.to_le_bytes());
        for c in [self.bbox.min, self.bbox.max] {
            out.extend_from_slice(&c.x.to_le_bytes());
            out.extend_from_slice(&c.y.to_le_bytes());
            out.extend_from_slice(&c.z.to_le_bytes());
        }
        out.extend_from_slice(&(self.leaves.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.active_count.to_le_bytes());
        for leaf in &self.leaves {
            out.extend_from_slice(&leaf.origin.x.to_le_bytes());
            out.extend_from_slice(&leaf.origin.y.to_le_bytes());
            out.extend_from_slice(&leaf.origin.z.to_le_bytes());
            for w in &leaf.mask {
                out.extend_from_slice(&w.to_le_bytes());
            }
            out.extend_from_slice(&(leaf.values.len() as u32).to_le_bytes());
            for v in &leaf.values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        out
    }

    /// 从字节数组还原网格
    pub fn from_bytes(bytes: &[u8]) -> GridResult<HostGrid> {
        let mut reader = ByteReader::new(bytes);
        if reader.read_u32()? != GRID_MAGIC {
            return Err(GridError::MalformedBytes("魔数不符".into()));
        }
        if reader.read_u32()? != GRID_VERSION {
            return Err(GridError::MalformedBytes("版本不符".into()));
        }
        let background = reader.read_f32()?;
        let min = reader.read_coord()?;
        let max = reader.read_coord()?;
        let leaf_count = reader.read_u32()? as usize;
        let active_count = reader.read_u32()?;

        let mut leaves = Vec::with_capacity(leaf_count);
        for _ in 0..leaf_count {
            let origin = reader.read_coord()?;
            let mut mask = [0u64; 8];
            for w in &mut mask {
                *w = reader.read_u64()?;
            }
            let value_count = reader.read_u32()? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(reader.read_f32()?);
            }
            let leaf = Leaf {
                origin,
                mask,
                values,
            };
            if leaf.active_count() as usize != leaf.values.len() {
                return Err(GridError::MalformedBytes("掩码与值数量不符".into()));
            }
            leaves.push(leaf);
        }

        Ok(HostGrid {
            background,
            bbox: CoordBBox::new(min, max),
            leaves,
            active_count,
        })
    }
}

/// 小端字节流读取器
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> GridResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(GridError::MalformedBytes("字节流被截断".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> GridResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> GridResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> GridResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_f32(&mut self) -> GridResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    fn read_coord(&mut self) -> GridResult<VoxelCoord> {
        Ok(VoxelCoord::new(
            self.read_i32()?,
            self.read_i32()?,
            self.read_i32()?,
        ))
    }
}

/// 逐体素网格构建器
#[derive(Debug)]
pub struct GridBuilder {
    background: f32,
    voxels: HashMap<VoxelCoord, f32>,
}

impl GridBuilder {
    /// 以指定背景值创建构建器
    pub fn new(background: f32) -> Self {
        Self {
            background,
            voxels: HashMap::new(),
        }
    }

    /// 设置体素值，重复设置取最后一次
    pub fn set(&mut self, coord: VoxelCoord, value: f32) -> &mut Self {
        self.voxels.insert(coord, value);
        self
    }

    /// 当前体素数
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// 打包为叶块结构
    ///
    /// 允许空网格通过构建，空集在上传阶段报错。
    pub fn build(&self) -> GridResult<HostGrid> {
        if self.voxels.is_empty() {
            return Ok(HostGrid {
                background: self.background,
                bbox: CoordBBox::from_point(VoxelCoord::ZERO),
                leaves: Vec::new(),
                active_count: 0,
            });
        }

        // 叶块原点 = 各分量向下取整到 8 的倍数
        let mut by_leaf: HashMap<VoxelCoord, Vec<(VoxelCoord, f32)>> = HashMap::new();
        let mut bbox: Option<CoordBBox> = None;
        for (&coord, &value) in &self.voxels {
            let origin = VoxelCoord::new(coord.x & !7, coord.y & !7, coord.z & !7);
            by_leaf.entry(origin).or_default().push((coord, value));
            match bbox {
                Some(ref mut b) => b.expand_point(coord),
                None => bbox = Some(CoordBBox::from_point(coord)),
            }
        }

        let mut origins: Vec<VoxelCoord> = by_leaf.keys().copied().collect();
        origins.sort_by_key(|&o| morton_encode(o));

        let mut leaves = Vec::with_capacity(origins.len());
        let mut active_count = 0u32;
        for origin in origins {
            let mut leaf = Leaf::new(origin);
            let mut entries = by_leaf.remove(&origin).unwrap_or_default();
            entries.sort_by_key(|(c, _)| Leaf::bit_index(*c - origin));
            for (coord, value) in entries {
                let bit = Leaf::bit_index(coord - origin);
                leaf.mask[bit >> 6] |= 1u64 << (bit & 63);
                leaf.values.push(value);
            }
            active_count += leaf.active_count();
            leaves.push(leaf);
        }

        let bbox = bbox.unwrap_or_else(|| CoordBBox::from_point(VoxelCoord::ZERO));
        Ok(HostGrid {
            background: self.background,
            bbox,
            leaves,
            active_count,
        })
    }
}
