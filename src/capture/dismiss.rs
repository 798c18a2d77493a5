//! Best-effort page preparation scripts.
//!
//! Both scripts are injected blind into arbitrary third-party pages, so
//! everything is wrapped defensively on the JS side and any failure is
//! swallowed by the caller.

/// Installed before navigation: native dialogs must never block a headless
/// capture, and popup windows are refused outright.
pub const INIT_SCRIPT: &str = r#"
window.alert = function () {};
window.confirm = function () { return true; };
window.prompt = function () { return null; };
window.open = function () { return null; };
"#;

/// Popup-dismissal heuristic run after load, before the screenshot:
/// click known close/consent buttons, collapse full-screen overlays above a
/// z-index threshold, and remove scroll-lock classes.
pub const DISMISS_SCRIPT: &str = r#"
(function () {
  var CLICK_TEXT = [
    'close', 'dismiss', 'accept', 'agree', 'got it', 'ok',
    "don't show again", 'no thanks', 'maybe later', 'x'
  ];
  var CLICK_CLASS = [
    '[class*="close"]', '[class*="dismiss"]', '[class*="consent"] button',
    '[class*="cookie"] button', '[aria-label="Close"]', '[aria-label="Dismiss"]'
  ];
  var Z_THRESHOLD = 1000;

  try {
    var candidates = document.querySelectorAll(CLICK_CLASS.join(','));
    for (var i = 0; i < candidates.length; i++) {
      try { candidates[i].click(); } catch (e) {}
    }

    var buttons = document.querySelectorAll('button, a, [role="button"]');
    for (var j = 0; j < buttons.length; j++) {
      var text = (buttons[j].textContent || '').trim().toLowerCase();
      if (CLICK_TEXT.indexOf(text) !== -1) {
        try { buttons[j].click(); } catch (e) {}
      }
    }

    var all = document.body ? document.body.querySelectorAll('*') : [];
    for (var k = 0; k < all.length; k++) {
      var el = all[k];
      var style = window.getComputedStyle(el);
      if ((style.position === 'fixed' || style.position === 'absolute') &&
          parseInt(style.zIndex, 10) >= Z_THRESHOLD) {
        var rect = el.getBoundingClientRect();
        if (rect.width >= window.innerWidth * 0.8 &&
            rect.height >= window.innerHeight * 0.8) {
          el.style.display = 'none';
        }
      }
    }

    var locks = ['modal-open', 'no-scroll', 'noscroll', 'overflow-hidden', 'scroll-lock'];
    for (var m = 0; m < locks.length; m++) {
      document.documentElement.classList.remove(locks[m]);
      if (document.body) { document.body.classList.remove(locks[m]); }
    }
    if (document.body) { document.body.style.overflow = 'visible'; }
  } catch (e) {}
})();
"#;
