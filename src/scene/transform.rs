use glam::{Affine3A, EulerRot, Mat3, Mat4, Quat, Vec3};

/// Transform component.
///
/// Holds a node's translation / rotation / scale together with the cached
/// local and world matrices. The local matrix is derived lazily: the public
/// TRS fields are compared against a shadow copy and the matrix is rebuilt
/// only when they differ, so callers can mutate `position` etc. directly.
#[derive(Debug, Clone)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,

    /// Rebuild the local matrix from TRS during world updates.
    pub matrix_auto_update: bool,
    /// Take part in scene-wide world matrix updates.
    pub matrix_world_auto_update: bool,

    pub(crate) local_matrix: Affine3A,
    pub(crate) world_matrix: Affine3A,
    pub(crate) world_needs_update: bool,

    last_position: Vec3,
    last_rotation: Quat,
    last_scale: Vec3,
    force_update: bool,
}

impl Transform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,

            matrix_auto_update: true,
            matrix_world_auto_update: true,

            local_matrix: Affine3A::IDENTITY,
            world_matrix: Affine3A::IDENTITY,
            world_needs_update: true,

            last_position: Vec3::ZERO,
            last_rotation: Quat::IDENTITY,
            last_scale: Vec3::ONE,
            force_update: true,
        }
    }

    // ========================================================================
    // Shadow state check
    // ========================================================================

    /// Rebuilds the local matrix if TRS changed since the last call.
    ///
    /// Returns whether the local matrix changed. With `matrix_auto_update`
    /// disabled only an explicit [`Self::mark_dirty`] reports a change.
    pub fn update_local_matrix(&mut self) -> bool {
        if !self.matrix_auto_update {
            let forced = self.force_update;
            self.force_update = false;
            return forced;
        }

        let changed = self.position != self.last_position
            || self.rotation != self.last_rotation
            || self.scale != self.last_scale
            || self.force_update;

        if changed {
            self.local_matrix =
                Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position);

            self.last_position = self.position;
            self.last_rotation = self.rotation;
            self.last_scale = self.scale;
            self.force_update = false;
        }

        changed
    }

    /// Unconditionally rebuilds the local matrix from TRS (when auto update
    /// is enabled) and clears the shadow state.
    pub(crate) fn refresh_local_matrix(&mut self) {
        self.force_update = true;
        self.update_local_matrix();
    }

    // ========================================================================
    // Getters & Helpers
    // ========================================================================

    pub fn set_rotation_euler(&mut self, x: f32, y: f32, z: f32) {
        self.rotation = Quat::from_euler(EulerRot::XYZ, x, y, z);
    }

    #[must_use]
    pub fn rotation_euler(&self) -> Vec3 {
        let (x, y, z) = self.rotation.to_euler(EulerRot::XYZ);
        Vec3::new(x, y, z)
    }

    #[inline]
    #[must_use]
    pub fn local_matrix(&self) -> &Affine3A {
        &self.local_matrix
    }

    #[inline]
    #[must_use]
    pub fn world_matrix(&self) -> &Affine3A {
        &self.world_matrix
    }

    #[inline]
    #[must_use]
    pub fn world_matrix_as_mat4(&self) -> Mat4 {
        Mat4::from(self.world_matrix)
    }

    /// Whether the cached world matrix is stale.
    #[inline]
    #[must_use]
    pub fn world_needs_update(&self) -> bool {
        self.world_needs_update
    }

    pub(crate) fn set_world_matrix(&mut self, mat: Affine3A) {
        self.world_matrix = mat;
        self.world_needs_update = false;
    }

    /// Sets the local matrix directly and decomposes it back into TRS.
    ///
    /// Shear is lost by the decomposition.
    pub fn apply_local_matrix(&mut self, mat: Affine3A) {
        self.local_matrix = mat;

        let (scale, rotation, translation) = mat.to_scale_rotation_translation();
        self.scale = scale;
        self.rotation = rotation;
        self.position = translation;

        self.last_scale = scale;
        self.last_rotation = rotation;
        self.last_position = translation;

        self.world_needs_update = true;
    }

    pub fn apply_local_matrix_from_mat4(&mut self, mat: Mat4) {
        self.apply_local_matrix(Affine3A::from_mat4(mat));
    }

    /// Orients -Z towards `target`. `target` and `up` are in parent space.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize_or_zero();
        if forward == Vec3::ZERO || forward.cross(up).length_squared() < 1e-8 {
            return;
        }

        let right = forward.cross(up).normalize();
        let new_up = right.cross(forward).normalize();

        let rot_mat = Mat3::from_cols(right, new_up, -forward);
        self.rotation = Quat::from_mat3(&rot_mat);
    }

    /// Forces the next update to rebuild local and world matrices.
    pub fn mark_dirty(&mut self) {
        self.force_update = true;
        self.world_needs_update = true;
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_trs_reports_no_change() {
        let mut t = Transform::new();
        assert!(t.update_local_matrix());
        assert!(!t.update_local_matrix());

        t.position.x = 2.0;
        assert!(t.update_local_matrix());
        assert!((t.local_matrix.translation.x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn manual_matrix_mode_ignores_trs() {
        let mut t = Transform::new();
        t.update_local_matrix();
        t.matrix_auto_update = false;

        t.position = Vec3::new(5.0, 0.0, 0.0);
        assert!(!t.update_local_matrix());
        assert_eq!(t.local_matrix.translation.x, 0.0);
    }
}
